//! 进度上报与 CLI 进度条。

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::Sender;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::{ProgressEvent, ProgressKind};

/// Receives status events from every worker thread.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Forwards events to a channel; a dropped receiver is ignored.
pub struct ChannelReporter {
    tx: Sender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

pub struct CallbackReporter<F>(pub F);

impl<F> ProgressReporter for CallbackReporter<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn report(&self, event: &ProgressEvent) {
        (self.0)(event)
    }
}

// ── CLI bars ──────────────────────────────────────────────────

/// One overall chapter bar plus one bar per running chapter.
pub struct CliProgress {
    mp: MultiProgress,
    overall: ProgressBar,
    chapter_style: ProgressStyle,
    chapters: Mutex<HashMap<String, ProgressBar>>,
    labels: HashMap<String, String>,
}

impl CliProgress {
    /// `labels` maps chapter ids to the text shown in front of their bar.
    pub fn new(total_chapters: usize, labels: HashMap<String, String>) -> Self {
        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        let overall_style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        let chapter_style =
            ProgressStyle::with_template("{prefix:>16} {bar:30} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-");

        let overall = mp.add(ProgressBar::new(total_chapters as u64));
        overall.set_style(overall_style);
        overall.set_prefix("Chapters");

        Self {
            mp,
            overall,
            chapter_style,
            chapters: Mutex::new(HashMap::new()),
            labels,
        }
    }

    /// Prints a line above the bars without tearing them.
    pub fn println(&self, line: &str) {
        let _ = self.mp.println(line);
    }

    pub fn finish(&self) {
        if let Ok(mut bars) = self.chapters.lock() {
            for (_, bar) in bars.drain() {
                bar.finish_and_clear();
            }
        }
        self.overall.finish_and_clear();
    }

    fn label(&self, chapter_id: &str) -> String {
        self.labels
            .get(chapter_id)
            .cloned()
            .unwrap_or_else(|| chapter_id.to_string())
    }

    fn with_bar(&self, chapter_id: &str, f: impl FnOnce(&ProgressBar)) {
        let Ok(mut bars) = self.chapters.lock() else {
            return;
        };
        let bar = bars.entry(chapter_id.to_string()).or_insert_with(|| {
            let bar = self.mp.add(ProgressBar::new(0));
            bar.set_style(self.chapter_style.clone());
            bar.set_prefix(self.label(chapter_id));
            bar
        });
        f(bar);
    }

    fn close_bar(&self, chapter_id: &str) {
        let Ok(mut bars) = self.chapters.lock() else {
            return;
        };
        if let Some(bar) = bars.remove(chapter_id) {
            bar.finish_and_clear();
            self.mp.remove(&bar);
        }
    }
}

impl ProgressReporter for CliProgress {
    fn report(&self, event: &ProgressEvent) {
        let id = event.chapter_id.as_str();
        match &event.kind {
            ProgressKind::Queued => {}
            ProgressKind::Started => self.with_bar(id, |bar| bar.set_message("listing images")),
            ProgressKind::ImageDone { done, total } => self.with_bar(id, |bar| {
                bar.set_length(*total as u64);
                bar.set_position(*done as u64);
                bar.set_message("");
            }),
            ProgressKind::ImageFailed { index } => {
                self.with_bar(id, |bar| bar.set_message(format!("page {} failed", index + 1)))
            }
            ProgressKind::Retrying { attempt } => {
                self.with_bar(id, |bar| bar.set_message(format!("retry #{attempt}")))
            }
            ProgressKind::Failed { reason } => {
                self.close_bar(id);
                self.println(&format!("{} failed: {reason}", self.label(id)));
                self.overall.inc(1);
            }
            ProgressKind::Cancelled { missing } => {
                self.close_bar(id);
                if *missing > 0 {
                    self.println(&format!("{} stopped, {missing} page(s) left", self.label(id)));
                }
                self.overall.inc(1);
            }
            ProgressKind::ChapterDone => {
                self.close_bar(id);
                if !event.detail.is_empty() {
                    self.println(&format!("{}: {}", self.label(id), event.detail));
                }
                self.overall.inc(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn channel_reporter_forwards_and_tolerates_closed_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reporter = ChannelReporter::new(tx);
        reporter.report(&ProgressEvent::new("c1", ProgressKind::Queued, ""));
        assert_eq!(rx.try_recv().unwrap().chapter_id, "c1");

        drop(rx);
        reporter.report(&ProgressEvent::new("c1", ProgressKind::Started, ""));
    }

    #[test]
    fn callback_reporter_sees_every_event() {
        let seen = AtomicUsize::new(0);
        let reporter = CallbackReporter(|_: &ProgressEvent| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        for _ in 0..3 {
            reporter.report(&ProgressEvent::new("c1", ProgressKind::ChapterDone, ""));
        }
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn cli_bars_accept_a_full_chapter_lifecycle() {
        let bars = CliProgress::new(1, HashMap::from([("c1".to_string(), "Ch. 1".to_string())]));
        for kind in [
            ProgressKind::Queued,
            ProgressKind::Started,
            ProgressKind::ImageDone { done: 1, total: 2 },
            ProgressKind::Retrying { attempt: 2 },
            ProgressKind::ImageFailed { index: 1 },
            ProgressKind::ChapterDone,
        ] {
            bars.report(&ProgressEvent::new("c1", kind, ""));
        }
        assert_eq!(bars.overall.position(), 1);
        bars.finish();
    }

    #[test]
    fn stopped_chapter_counts_once_without_failing() {
        let bars = CliProgress::new(1, HashMap::from([("c1".to_string(), "Ch. 1".to_string())]));
        bars.report(&ProgressEvent::new("c1", ProgressKind::Started, ""));
        bars.report(&ProgressEvent::new("c1", ProgressKind::Cancelled { missing: 3 }, ""));
        assert_eq!(bars.overall.position(), 1);
        assert!(bars.chapters.lock().unwrap().is_empty());
        bars.finish();
    }
}
