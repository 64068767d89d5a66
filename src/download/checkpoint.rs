//! 按章节持久化的下载进度。
//!
//! 布局：`<root>/<series key>/.checkpoint/<可读 id>-<id 摘要>.json`，每章一个文件。
//! 每次更新都经临时文件 + rename 整体重写，崩溃后只会留下旧记录或新记录。
//! 同一章节同一时刻只归一个 worker 所有，因此下面的读-改-写无需加锁。

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::base_system::atomic_write::write_atomic;
use crate::base_system::series_paths::{CHECKPOINT_DIR, safe_fs_name};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("chapter {chapter_id} is missing images {missing:?}")]
    IncompleteChapter {
        chapter_id: String,
        missing: Vec<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChapterCheckpoint {
    pub chapter_id: String,
    #[serde(default)]
    pub status: ChapterStatus,
    #[serde(default)]
    pub completed_images: BTreeSet<usize>,
    #[serde(default)]
    pub total_images: Option<usize>,
}

impl ChapterCheckpoint {
    fn pending(chapter_id: &str) -> Self {
        Self {
            chapter_id: chapter_id.to_string(),
            ..Self::default()
        }
    }

    /// Indices in `[0, total)` not yet downloaded. Empty when the total is unknown.
    pub fn missing(&self) -> Vec<usize> {
        let Some(total) = self.total_images else {
            return Vec::new();
        };
        (0..total)
            .filter(|i| !self.completed_images.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.status == ChapterStatus::Complete
    }
}

/// All chapter records of one series, keyed by chapter id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub chapters: BTreeMap<String, ChapterCheckpoint>,
}

impl CheckpointRecord {
    pub fn completed_chapters(&self) -> impl Iterator<Item = &str> {
        self.chapters
            .values()
            .filter(|c| c.is_complete())
            .map(|c| c.chapter_id.as_str())
    }
}

pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir_for(&self, series_key: &str) -> PathBuf {
        self.root.join(series_key).join(CHECKPOINT_DIR)
    }

    fn chapter_path(&self, series_key: &str, chapter_id: &str) -> PathBuf {
        self.dir_for(series_key).join(record_file_name(chapter_id))
    }

    /// Reads every chapter record of a series. Unreadable files are logged and
    /// skipped, so those chapters count as pending.
    pub fn load(&self, series_key: &str) -> Result<CheckpointRecord, CheckpointError> {
        let dir = self.dir_for(series_key);
        let mut record = CheckpointRecord::default();

        let entries = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(record),
            Err(source) => return Err(CheckpointError::Io { path: dir, source }),
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_json = path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.eq_ignore_ascii_case("json"));
            if !is_json {
                continue;
            }
            match read_record(&path) {
                Ok(Some(chapter)) => {
                    record.chapters.insert(chapter.chapter_id.clone(), chapter);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "checkpoint", path = %path.display(), error = %err, "ignoring unreadable checkpoint");
                }
            }
        }

        Ok(record)
    }

    /// Current record of one chapter; pending if none exists or it is unreadable.
    pub fn chapter(
        &self,
        series_key: &str,
        chapter_id: &str,
    ) -> Result<ChapterCheckpoint, CheckpointError> {
        let path = self.chapter_path(series_key, chapter_id);
        match read_record(&path) {
            Ok(Some(rec)) if rec.chapter_id == chapter_id => Ok(rec),
            Ok(Some(rec)) => {
                warn!(
                    target: "checkpoint",
                    chapter_id,
                    found = %rec.chapter_id,
                    path = %path.display(),
                    "checkpoint belongs to another chapter, ignoring"
                );
                Ok(ChapterCheckpoint::pending(chapter_id))
            }
            Ok(None) => Ok(ChapterCheckpoint::pending(chapter_id)),
            Err(CheckpointError::Serialize(err)) => {
                warn!(target: "checkpoint", chapter_id, error = %err, "corrupt checkpoint, starting over");
                Ok(ChapterCheckpoint::pending(chapter_id))
            }
            Err(err) => Err(err),
        }
    }

    /// Marks the chapter in progress with `total_images` pages.
    ///
    /// If an earlier run saw a different page count the recorded progress no
    /// longer lines up with the image list, so it is discarded.
    pub fn begin_chapter(
        &self,
        series_key: &str,
        chapter_id: &str,
        total_images: usize,
    ) -> Result<ChapterCheckpoint, CheckpointError> {
        let mut rec = self.chapter(series_key, chapter_id)?;
        if let Some(prev) = rec.total_images {
            if prev != total_images {
                warn!(
                    target: "checkpoint",
                    chapter_id,
                    previous = prev,
                    now = total_images,
                    "image count changed, restarting chapter"
                );
                rec.completed_images.clear();
            }
        }
        rec.completed_images.retain(|&i| i < total_images);
        rec.total_images = Some(total_images);
        rec.status = ChapterStatus::InProgress;
        self.save(series_key, &rec)?;
        Ok(rec)
    }

    /// Records image `index` as written. Recording it twice is a no-op.
    pub fn mark_image_done(
        &self,
        series_key: &str,
        chapter_id: &str,
        index: usize,
    ) -> Result<(), CheckpointError> {
        let mut rec = self.chapter(series_key, chapter_id)?;
        if !rec.completed_images.insert(index) {
            return Ok(());
        }
        if rec.status == ChapterStatus::Pending {
            rec.status = ChapterStatus::InProgress;
        }
        self.save(series_key, &rec)
    }

    pub fn mark_chapter_complete(
        &self,
        series_key: &str,
        chapter_id: &str,
    ) -> Result<(), CheckpointError> {
        let mut rec = self.chapter(series_key, chapter_id)?;
        let missing = match rec.total_images {
            Some(_) => rec.missing(),
            // nothing was ever begun, so nothing can be complete
            None => vec![0],
        };
        if !missing.is_empty() {
            return Err(CheckpointError::IncompleteChapter {
                chapter_id: chapter_id.to_string(),
                missing,
            });
        }
        rec.status = ChapterStatus::Complete;
        self.save(series_key, &rec)?;
        debug!(target: "checkpoint", chapter_id, "chapter complete");
        Ok(())
    }

    pub fn is_chapter_complete(&self, series_key: &str, chapter_id: &str) -> bool {
        self.chapter(series_key, chapter_id)
            .map(|rec| rec.is_complete())
            .unwrap_or(false)
    }

    fn save(&self, series_key: &str, rec: &ChapterCheckpoint) -> Result<(), CheckpointError> {
        let dir = self.dir_for(series_key);
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = self.chapter_path(series_key, &rec.chapter_id);
        let bytes = serde_json::to_vec_pretty(rec)?;
        write_atomic(&path, &bytes).map_err(|source| CheckpointError::Io { path, source })
    }
}

/// The readable part is lossy, the digest of the raw id keeps names distinct.
fn record_file_name(chapter_id: &str) -> String {
    let digest = Sha256::digest(chapter_id.as_bytes());
    format!(
        "{}-{}.json",
        safe_fs_name(chapter_id, 80),
        hex::encode(&digest[..8])
    )
}

fn read_record(path: &Path) -> Result<Option<ChapterCheckpoint>, CheckpointError> {
    let raw = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}
