//! 限并发的章节调度器。
//!
//! 任务按目录顺序进入 crossbeam 队列，由 `max_threads` 个 worker 线程消费。
//! worker 在取任务和等待启动间隔期间持有启动闸（上次启动时间），
//! 所以章节按队列顺序启动，且间隔不小于 `start_delay`。

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use tracing::{debug, error, info};

use super::RunContext;
use super::chapter::ChapterDownloader;
use super::checkpoint::CheckpointStore;
use super::models::{
    ChapterOutcome, ChapterResult, DownloadTask, ProgressEvent, ProgressKind,
};
use crate::base_system::retry::sleep_cancellable;

pub struct DownloadScheduler<'a> {
    ctx: &'a RunContext,
    store: &'a CheckpointStore,
    max_threads: usize,
    start_delay: Duration,
}

impl<'a> DownloadScheduler<'a> {
    pub fn new(ctx: &'a RunContext, store: &'a CheckpointStore) -> Self {
        Self {
            ctx,
            store,
            max_threads: ctx.config.max_workers.max(1),
            start_delay: ctx.config.chapter_start_delay(),
        }
    }

    /// Runs every task to a terminal outcome. Results are ordered by
    /// `sequence_index`, whatever order the chapters finished in.
    pub fn run(&self, series_key: &str, tasks: Vec<DownloadTask>) -> Vec<ChapterResult> {
        if tasks.is_empty() {
            return Vec::new();
        }

        for task in &tasks {
            self.ctx.reporter.report(&ProgressEvent::new(
                task.chapter.id.as_str(),
                ProgressKind::Queued,
                task.chapter.display_number.to_string(),
            ));
        }

        let workers = self.max_threads.min(tasks.len());
        info!(
            target: "scheduler",
            chapters = tasks.len(),
            workers,
            delay = ?self.start_delay,
            "starting downloads"
        );

        let (tx, rx) = channel::unbounded::<DownloadTask>();
        for task in &tasks {
            let _ = tx.send(task.clone());
        }
        drop(tx);

        let (tx_res, rx_res) = channel::unbounded::<ChapterResult>();
        let gate: Mutex<Option<Instant>> = Mutex::new(None);
        let mut worker_panicked = false;

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for n in 0..workers {
                let rx = rx.clone();
                let tx_res = tx_res.clone();
                let gate = &gate;
                let spawned = thread::Builder::new()
                    .name(format!("chapter-worker-{n}"))
                    .spawn_scoped(scope, move || {
                        self.worker_loop(series_key, &rx, &tx_res, gate)
                    });
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(err) => error!(target: "scheduler", error = %err, "failed to spawn worker"),
                }
            }
            for h in handles {
                if h.join().is_err() {
                    worker_panicked = true;
                }
            }
        });
        drop(tx_res);

        let mut results: Vec<ChapterResult> = rx_res.iter().collect();

        // Anything without a result was lost with a dead worker or never
        // started because of a stop request.
        let reported: HashSet<usize> = results.iter().map(|r| r.chapter.sequence_index).collect();
        let cancelled = self.ctx.cancel.load(Ordering::Relaxed);
        for task in tasks {
            if reported.contains(&task.chapter.sequence_index) {
                continue;
            }
            let outcome = if cancelled && !worker_panicked {
                ChapterOutcome::Cancelled {
                    missing: Vec::new(),
                }
            } else {
                ChapterOutcome::Failed {
                    reason: "worker stopped before the chapter ran".to_string(),
                }
            };
            results.push(ChapterResult {
                chapter: task.chapter,
                outcome,
            });
        }

        results.sort_by_key(|r| r.chapter.sequence_index);
        results
    }

    fn worker_loop(
        &self,
        series_key: &str,
        rx: &channel::Receiver<DownloadTask>,
        tx_res: &channel::Sender<ChapterResult>,
        gate: &Mutex<Option<Instant>>,
    ) {
        let downloader = ChapterDownloader {
            fetcher: self.ctx.fetcher.as_ref(),
            images: self.ctx.image_lister.as_ref(),
            store: self.store,
            reporter: self.ctx.reporter.as_ref(),
            cancel: self.ctx.cancel.as_ref(),
            series_key,
            image_delay: self.ctx.config.image_delay(),
        };

        loop {
            let (task, started_at) = {
                let mut last = lock_gate(gate);
                let Ok(task) = rx.recv() else {
                    break;
                };
                if !self.wait_for_slot(&last) {
                    drop(last);
                    self.ctx.reporter.report(&ProgressEvent::new(
                        task.chapter.id.as_str(),
                        ProgressKind::Cancelled { missing: 0 },
                        "not started",
                    ));
                    let _ = tx_res.send(ChapterResult {
                        chapter: task.chapter,
                        outcome: ChapterOutcome::Cancelled {
                            missing: Vec::new(),
                        },
                    });
                    continue;
                }
                let now = Instant::now();
                *last = Some(now);
                (task, now)
            };

            self.ctx.reporter.report(&ProgressEvent::at(
                task.chapter.id.as_str(),
                ProgressKind::Started,
                task.chapter.display_number.to_string(),
                started_at,
            ));
            debug!(target: "scheduler", chapter = %task.chapter.display_number, "chapter started");

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| downloader.download(&task)))
                .unwrap_or_else(|_| {
                    let reason = "worker panicked".to_string();
                    self.ctx.reporter.report(&ProgressEvent::new(
                        task.chapter.id.as_str(),
                        ProgressKind::Failed {
                            reason: reason.clone(),
                        },
                        "",
                    ));
                    ChapterOutcome::Failed { reason }
                });

            let _ = tx_res.send(ChapterResult {
                chapter: task.chapter,
                outcome,
            });
        }
    }

    /// Sleeps until `start_delay` has passed since the previous start.
    /// Returns `false` if the run was stopped first.
    fn wait_for_slot(&self, last: &Option<Instant>) -> bool {
        let cancel = self.ctx.cancel.as_ref();
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let Some(prev) = *last else {
            return true;
        };
        let wait = (prev + self.start_delay).saturating_duration_since(Instant::now());
        sleep_cancellable(wait, cancel)
    }
}

fn lock_gate(gate: &Mutex<Option<Instant>>) -> MutexGuard<'_, Option<Instant>> {
    // A poisoned gate still holds a valid instant.
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
