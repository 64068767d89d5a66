//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`     ：数据模型（章节号 / 章节选择 / 结果 / 进度事件）
//! - `source`     ：站点解析器实现的列表 trait
//! - `fetcher`    ：HTTP 请求、重试与退避
//! - `catalog`    ：系列 URL → 有序章节，选择过滤
//! - `checkpoint` ：章节级持久化进度
//! - `chapter`    ：单章下载
//! - `scheduler`  ：带启动间隔的工作池
//! - `progress`   ：进度上报与 CLI 进度条

pub mod catalog;
pub mod chapter;
pub mod checkpoint;
pub mod fetcher;
pub mod models;
pub mod progress;
pub mod scheduler;
pub mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;
use tracing::{info, warn};

use self::catalog::{Catalog, CatalogError, ChapterCatalog};
use self::checkpoint::CheckpointStore;
use self::fetcher::Fetch;
use self::models::{ChapterSelection, DownloadTask, RunReport};
use self::progress::ProgressReporter;
use self::scheduler::DownloadScheduler;
use self::source::{ChapterLister, ImageLister};
use crate::base_system::context::Config;
use crate::base_system::series_paths::{chapter_folder_path, series_folder_name, series_folder_path};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Everything one run needs. Nothing in the pipeline reads global state.
pub struct RunContext {
    pub config: Config,
    pub fetcher: Arc<dyn Fetch>,
    pub chapter_lister: Arc<dyn ChapterLister>,
    pub image_lister: Arc<dyn ImageLister>,
    pub reporter: Arc<dyn ProgressReporter>,
    pub cancel: Arc<AtomicBool>,
}

impl RunContext {
    pub fn catalog(&self) -> ChapterCatalog<'_> {
        ChapterCatalog {
            fetcher: self.fetcher.as_ref(),
            lister: self.chapter_lister.as_ref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub series_url: String,
    pub selection: ChapterSelection,
    pub output_root: PathBuf,
}

/// Resolves the catalog and downloads the selected chapters.
///
/// Only an unavailable catalog is an error; every chapter-level problem is
/// reported in the returned [`RunReport`].
pub fn download_series(
    ctx: &RunContext,
    request: &DownloadRequest,
) -> Result<RunReport, PipelineError> {
    let catalog = ctx.catalog().resolve(&request.series_url)?;
    Ok(download_catalog(ctx, &catalog, request))
}

/// Same as [`download_series`] for an already resolved catalog.
///
/// Checkpoints are kept under `request.output_root`, beside the chapters.
pub fn download_catalog(ctx: &RunContext, catalog: &Catalog, request: &DownloadRequest) -> RunReport {
    let selected = catalog::filter(catalog, &request.selection);
    let series_key = series_folder_name(&catalog.series_title);
    let series_dir = series_folder_path(&request.output_root, &catalog.series_title);

    if selected.chapters.is_empty() {
        warn!(target: "download", selection = %request.selection, "nothing to download");
    } else {
        info!(
            target: "download",
            series = %catalog.series_title,
            selected = selected.chapters.len(),
            dir = %series_dir.display(),
            "downloading"
        );
    }

    let tasks: Vec<DownloadTask> = selected
        .chapters
        .into_iter()
        .map(|chapter| DownloadTask {
            output_dir: chapter_folder_path(&series_dir, chapter.display_number),
            chapter,
        })
        .collect();

    let store = CheckpointStore::new(&request.output_root);
    let results = DownloadScheduler::new(ctx, &store).run(&series_key, tasks);

    RunReport {
        series_title: catalog.series_title.clone(),
        series_dir,
        results,
        not_found: selected.not_found,
    }
}
