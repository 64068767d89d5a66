//! 纯命令行前端：解析目录、下载、打印汇总。

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::base_system::context::Config;
use crate::base_system::series_paths::chapter_label;
use crate::download::fetcher::PageFetcher;
use crate::download::models::{ChapterOutcome, ChapterSelection, RunReport};
use crate::download::progress::{CliProgress, NullReporter, ProgressReporter};
use crate::download::{DownloadRequest, RunContext, download_catalog};
use crate::network_parser::weebcentral::WeebCentralParser;

pub struct RunOptions {
    pub series_url: Option<String>,
    pub chapters: Option<String>,
    pub output: Option<PathBuf>,
    pub show_progress: bool,
}

pub fn run(config: Config, options: RunOptions) -> Result<RunReport> {
    let series_url = match options.series_url {
        Some(url) => url,
        None => read_line("Enter the manga URL: ")?,
    };
    let series_url = series_url.trim().to_string();
    if series_url.is_empty() {
        return Err(anyhow!("no series URL given"));
    }

    let chapters = match options.chapters {
        Some(expr) => expr,
        None => read_line(
            "Chapter selection (blank for all, e.g. 12 or 5-10.5): ",
        )?,
    };
    let selection = ChapterSelection::parse(&chapters)?;

    let output_root = options.output.unwrap_or_else(|| config.default_save_dir());
    std::fs::create_dir_all(&output_root)
        .with_context(|| format!("cannot create output directory {}", output_root.display()))?;

    let cancel = install_stop_handler()?;
    let fetcher = Arc::new(PageFetcher::new(&config, Some(cancel.clone()))?);
    let parser = Arc::new(WeebCentralParser::from_config(&config));

    let mut ctx = RunContext {
        config,
        fetcher,
        chapter_lister: parser.clone(),
        image_lister: parser,
        reporter: Arc::new(NullReporter),
        cancel,
    };

    println!("Fetching chapter list...");
    let catalog = ctx.catalog().resolve(&series_url)?;
    println!(
        "{}: {} chapter(s) available",
        catalog.series_title,
        catalog.chapters.len()
    );

    let request = DownloadRequest {
        series_url,
        selection,
        output_root,
    };

    let bars = if options.show_progress {
        let selected = crate::download::catalog::filter(&catalog, &selection);
        let labels: HashMap<String, String> = selected
            .chapters
            .iter()
            .map(|c| (c.id.clone(), chapter_label(c.display_number)))
            .collect();
        let bars = Arc::new(CliProgress::new(selected.chapters.len(), labels));
        ctx.reporter = bars.clone() as Arc<dyn ProgressReporter>;
        Some(bars)
    } else {
        None
    };

    let report = download_catalog(&ctx, &catalog, &request);
    if let Some(bars) = bars {
        bars.finish();
    }

    print_summary(&report);
    Ok(report)
}

/// First Ctrl-C asks workers to stop after their current image; the second exits.
fn install_stop_handler() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let presses = AtomicU8::new(0);
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            flag.store(true, Ordering::SeqCst);
            eprintln!("\nStopping after the current pages... press Ctrl-C again to quit now.");
        } else {
            std::process::exit(130);
        }
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn print_summary(report: &RunReport) {
    let done = report.succeeded().len();
    let total = report.results.len();
    println!();
    println!("{}: {done}/{total} chapter(s) complete", report.series_title);
    println!("Saved to {}", report.series_dir.display());

    for missing in &report.not_found {
        println!("  not in catalog: {missing}");
    }

    for result in &report.results {
        let number = result.chapter.display_number;
        match &result.outcome {
            ChapterOutcome::Done { .. } => {}
            ChapterOutcome::PartiallyFailed { missing } => println!(
                "  chapter {number} ({}): missing page(s) {}",
                result.chapter.id,
                page_list(missing)
            ),
            ChapterOutcome::Failed { reason } => {
                println!("  chapter {number} ({}): failed: {reason}", result.chapter.id)
            }
            ChapterOutcome::Cancelled { missing } if missing.is_empty() => {
                println!("  chapter {number} ({}): not started", result.chapter.id)
            }
            ChapterOutcome::Cancelled { missing } => println!(
                "  chapter {number} ({}): stopped, missing page(s) {}",
                result.chapter.id,
                page_list(missing)
            ),
        }
    }

    if report.all_done() {
        info!(target: "cli", chapters = total, "all chapters complete");
    } else {
        warn!(
            target: "cli",
            partial = report.partially_failed().len(),
            failed = report.failed().len(),
            cancelled = report.cancelled().len(),
            "run finished with gaps"
        );
        println!("Run the same command again to fetch only what is missing.");
    }
}

/// 1-based page numbers, as they appear in file names.
fn page_list(missing: &[usize]) -> String {
    missing
        .iter()
        .map(|i| (i + 1).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush().ok();
    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(line)
}
