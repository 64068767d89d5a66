//! WeebCentral 漫画下载器命令行入口。

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::info;

use weebcentral_manga_downloader::base_system::config::load_or_create;
use weebcentral_manga_downloader::base_system::context::Config;
use weebcentral_manga_downloader::base_system::logging::{LogOptions, LogSystem};
use weebcentral_manga_downloader::ui::noui::{self, RunOptions};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "weebcentral-manga-downloader")]
#[command(about = "Download manga chapters from WeebCentral, resuming interrupted runs")]
struct Cli {
    /// Series URL, e.g. https://weebcentral.com/series/<id>/<name> (prompted if omitted)
    url: Option<String>,

    /// Chapters to download: `12`, `5-10.5`, or empty for all (prompted if omitted)
    #[arg(short = 'c', long)]
    chapters: Option<String>,

    /// Output root directory (default: `save_path` from config.yml)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Minimum seconds between two chapter starts
    #[arg(long)]
    delay: Option<f64>,

    /// Number of chapters downloaded in parallel
    #[arg(long)]
    threads: Option<usize>,

    /// Directory holding config.yml and logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose console logging
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Disable progress bars and log to the console instead
    #[arg(long, default_value_t = false)]
    no_progress: bool,

    /// Print the version and exit
    #[arg(long, default_value_t = false)]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("WeebCentral Manga Downloader v{}", VERSION);
        return Ok(());
    }

    let data_dir = cli.data_dir.as_deref();
    let log = init_logging(cli.debug, cli.no_progress, data_dir)?;
    info!(target: "startup", "version v{}", VERSION);

    let mut config = load_or_create::<Config>(data_dir).map_err(|e| anyhow!(e.to_string()))?;
    if let Some(delay) = cli.delay {
        config.delay_seconds = delay;
    }
    if let Some(threads) = cli.threads {
        config.max_workers = threads;
    }
    config.validate().map_err(|e| anyhow!(e.to_string()))?;

    let report = noui::run(
        config,
        RunOptions {
            series_url: cli.url,
            chapters: cli.chapters,
            output: cli.output,
            show_progress: !cli.no_progress,
        },
    )?;

    if !report.all_done() {
        // flush the file log before bypassing destructors
        drop(log);
        std::process::exit(2);
    }
    drop(log);
    Ok(())
}

fn init_logging(debug: bool, console: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: false,
        console,
    };
    LogSystem::init(opts, base_dir).map_err(|e| anyhow!(e))
}
