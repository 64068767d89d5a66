//! 下载单个章节的全部图片，并从检查点续传。

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::checkpoint::{CheckpointError, CheckpointStore};
use super::fetcher::{Fetch, FetchError, FetchKind};
use super::models::{ChapterOutcome, DownloadTask, ProgressEvent, ProgressKind};
use super::progress::ProgressReporter;
use super::source::ImageLister;
use crate::base_system::atomic_write::write_atomic;
use crate::base_system::retry::sleep_cancellable;
use crate::base_system::series_paths::image_file_name;

const URL_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

pub struct ChapterDownloader<'a> {
    pub fetcher: &'a dyn Fetch,
    pub images: &'a dyn ImageLister,
    pub store: &'a CheckpointStore,
    pub reporter: &'a dyn ProgressReporter,
    pub cancel: &'a AtomicBool,
    pub series_key: &'a str,
    /// Pause between two image requests.
    pub image_delay: Duration,
}

impl ChapterDownloader<'_> {
    pub fn download(&self, task: &DownloadTask) -> ChapterOutcome {
        let chapter = &task.chapter;
        let id = chapter.id.as_str();

        let checkpoint = match self.store.chapter(self.series_key, id) {
            Ok(c) => c,
            Err(err) => return self.fail(id, format!("cannot read checkpoint: {err}")),
        };
        if checkpoint.is_complete() {
            debug!(target: "download", chapter = %chapter.display_number, "already complete, skipping");
            self.emit(id, ProgressKind::ChapterDone, "already downloaded");
            return ChapterOutcome::Done {
                resumed_from_checkpoint: true,
            };
        }

        let urls = match self.images.list_images(self.fetcher, &chapter.source_url) {
            Ok(urls) if urls.is_empty() => return self.fail(id, "no images found".to_string()),
            Ok(urls) => urls,
            Err(err) if err.is_cancelled() => return self.cancelled(id, Vec::new()),
            Err(err) => return self.fail(id, err.to_string()),
        };
        let total = urls.len();

        let state = match self.store.begin_chapter(self.series_key, id, total) {
            Ok(s) => s,
            Err(err) => return self.fail(id, format!("cannot write checkpoint: {err}")),
        };
        if let Err(err) = fs::create_dir_all(&task.output_dir) {
            return self.fail(
                id,
                format!("cannot create {}: {err}", task.output_dir.display()),
            );
        }

        let resumed = !state.completed_images.is_empty();
        if resumed {
            info!(
                target: "download",
                chapter = %chapter.display_number,
                done = state.completed_images.len(),
                total,
                "resuming chapter"
            );
        }

        let mut done = state.completed_images.len();
        let mut missing = Vec::new();
        let mut fetched_any = false;
        let completed = &state.completed_images;
        let remaining = |from: usize| (from..total).filter(move |i| !completed.contains(i));

        for (index, url) in urls.iter().enumerate() {
            if completed.contains(&index) {
                continue;
            }
            if self.cancel.load(Ordering::Relaxed) {
                missing.extend(remaining(index));
                return self.cancelled(id, missing);
            }
            if fetched_any && !sleep_cancellable(self.image_delay, self.cancel) {
                missing.extend(remaining(index));
                return self.cancelled(id, missing);
            }
            fetched_any = true;

            let on_retry = |attempt: u32, err: &FetchError| {
                self.emit(id, ProgressKind::Retrying { attempt }, err.to_string());
            };
            let bytes = match self.fetcher.fetch_observed(
                url,
                FetchKind::Image {
                    referer: Some(&chapter.source_url),
                },
                &on_retry,
            ) {
                Ok(b) => b,
                Err(err) if err.is_cancelled() => {
                    missing.extend(remaining(index));
                    return self.cancelled(id, missing);
                }
                Err(err) => {
                    warn!(target: "download", chapter = %chapter.display_number, page = index + 1, error = %err, "image failed");
                    self.emit(id, ProgressKind::ImageFailed { index }, err.to_string());
                    missing.push(index);
                    continue;
                }
            };

            let name = image_file_name(index, total, image_extension(url, &bytes));
            let path = task.output_dir.join(&name);
            if let Err(err) = write_atomic(&path, &bytes) {
                warn!(target: "download", path = %path.display(), error = %err, "image write failed");
                self.emit(id, ProgressKind::ImageFailed { index }, err.to_string());
                missing.push(index);
                continue;
            }
            if let Err(err) = self.store.mark_image_done(self.series_key, id, index) {
                // The file is on disk but unrecorded; the next run fetches it again.
                warn!(target: "download", chapter_id = id, index, error = %err, "checkpoint update failed");
                self.emit(id, ProgressKind::ImageFailed { index }, err.to_string());
                missing.push(index);
                continue;
            }

            done += 1;
            self.emit(id, ProgressKind::ImageDone { done, total }, name);
        }

        if !missing.is_empty() {
            warn!(
                target: "download",
                chapter = %chapter.display_number,
                missing = ?missing,
                "chapter incomplete"
            );
            self.emit(
                id,
                ProgressKind::ChapterDone,
                format!("{} of {total} page(s) missing", missing.len()),
            );
            return ChapterOutcome::PartiallyFailed { missing };
        }

        match self.store.mark_chapter_complete(self.series_key, id) {
            Ok(()) => {
                info!(target: "download", chapter = %chapter.display_number, pages = total, "chapter done");
                self.emit(id, ProgressKind::ChapterDone, "");
                ChapterOutcome::Done {
                    resumed_from_checkpoint: resumed,
                }
            }
            Err(CheckpointError::IncompleteChapter { missing, .. }) => {
                error!(target: "download", chapter_id = id, missing = ?missing, "checkpoint disagrees with downloaded pages");
                self.emit(
                    id,
                    ProgressKind::ChapterDone,
                    format!("{} page(s) unrecorded", missing.len()),
                );
                ChapterOutcome::PartiallyFailed { missing }
            }
            Err(err) => self.fail(id, format!("cannot write checkpoint: {err}")),
        }
    }

    fn emit(&self, chapter_id: &str, kind: ProgressKind, detail: impl Into<String>) {
        self.reporter
            .report(&ProgressEvent::new(chapter_id, kind, detail));
    }

    fn fail(&self, chapter_id: &str, reason: String) -> ChapterOutcome {
        error!(target: "download", chapter_id, %reason, "chapter failed");
        self.emit(
            chapter_id,
            ProgressKind::Failed {
                reason: reason.clone(),
            },
            "",
        );
        ChapterOutcome::Failed { reason }
    }

    fn cancelled(&self, chapter_id: &str, mut missing: Vec<usize>) -> ChapterOutcome {
        missing.sort_unstable();
        missing.dedup();
        info!(target: "download", chapter_id, remaining = missing.len(), "chapter stopped");
        self.emit(
            chapter_id,
            ProgressKind::Cancelled {
                missing: missing.len(),
            },
            "stopped",
        );
        ChapterOutcome::Cancelled { missing }
    }
}

/// File extension for an image: the URL's if it is a known image type,
/// otherwise sniffed from the bytes, otherwise `jpg`.
pub fn image_extension(url: &str, bytes: &[u8]) -> &'static str {
    let from_url = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segs| segs.last().map(str::to_string))
        })
        .and_then(|last| {
            last.rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
        });
    if let Some(ext) = from_url {
        if let Some(known) = URL_EXTENSIONS.iter().find(|e| **e == ext) {
            return *known;
        }
    }

    image::guess_format(bytes)
        .ok()
        .and_then(|fmt| fmt.extensions_str().first().copied())
        .unwrap_or("jpg")
}
