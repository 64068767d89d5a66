//! 日志初始化。
//!
//! 控制台输出可选（否则 stderr 留给进度条），文件层以非阻塞方式写入
//! `logs/latest.log`。启动时超过 [`ROTATE_AT_BYTES`] 的日志会被压缩归档，
//! 只保留最新的 [`KEEP_ARCHIVES`] 个 zip。

use std::fs;
use std::io;
use std::panic;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};
use zip::CompressionMethod;
use zip::write::FileOptions;

pub const LOG_FILE: &str = "latest.log";
pub const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
pub const KEEP_ARCHIVES: usize = 10;
const ARCHIVE_PREFIX: &str = "log_";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("cannot prepare log directory {path}: {source}")]
    Dir { path: PathBuf, source: io::Error },
    #[error("log archive failed: {0}")]
    Archive(String),
    #[error("tracing subscriber already set: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    /// DEBUG instead of INFO on the console.
    pub debug: bool,
    pub use_color: bool,
    /// Zip `latest.log` when the process exits.
    pub archive_on_exit: bool,
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: false,
            console: true,
        }
    }
}

/// Owns the file writer. Dropping it flushes pending lines.
pub struct LogSystem {
    logs_dir: PathBuf,
    guard: Option<WorkerGuard>,
    archive_on_exit: bool,
}

impl LogSystem {
    pub fn init(options: LogOptions, base_dir: Option<&Path>) -> Result<Self, LogError> {
        let logs_dir = base_dir.unwrap_or(Path::new(".")).join("logs");
        fs::create_dir_all(&logs_dir).map_err(|source| LogError::Dir {
            path: logs_dir.clone(),
            source,
        })?;

        let latest = logs_dir.join(LOG_FILE);
        let oversized = fs::metadata(&latest).is_ok_and(|m| m.len() >= ROTATE_AT_BYTES);
        if oversized {
            // Not fatal: a failed rotation only means a longer log.
            if let Err(err) = archive(&logs_dir) {
                eprintln!("log rotation failed: {err}");
            }
        }

        let (writer, guard) = NonBlockingBuilder::default()
            .lossy(false)
            .thread_name("log-writer")
            .finish(tracing_appender::rolling::never(&logs_dir, LOG_FILE));

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(writer)
            .with_filter(LevelFilter::DEBUG);

        let console_layer = options.console.then(|| {
            let level = if options.debug {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            };
            fmt::layer()
                .with_ansi(options.use_color)
                .with_target(false)
                .with_thread_names(options.debug)
                .with_writer(io::stderr)
                .with_filter(level)
        });

        tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer)
            .try_init()?;

        install_panic_logger();
        debug!(target: "startup", dir = %logs_dir.display(), "logging ready");

        Ok(Self {
            logs_dir,
            guard: Some(guard),
            archive_on_exit: options.archive_on_exit,
        })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        // joins the writer thread, so everything logged so far is on disk
        drop(self.guard.take());
        if self.archive_on_exit {
            if let Err(err) = archive(&self.logs_dir) {
                eprintln!("log archive failed: {err}");
            }
        }
    }
}

/// Routes panics (chapter workers included) into the log before the default
/// hook prints them.
fn install_panic_logger() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("unnamed");
        match info.location() {
            Some(loc) => error!(
                target: "panic",
                thread = name,
                "{} ({}:{})",
                info,
                loc.file(),
                loc.line()
            ),
            None => error!(target: "panic", thread = name, "{info}"),
        }
        previous(info);
    }));
}

/// Moves `latest.log` into a timestamped zip and prunes old archives.
/// Returns the archive path, or `None` when there was nothing to archive.
pub fn archive(logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let latest = logs_dir.join(LOG_FILE);
    let content = match fs::read(&latest) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LogError::Archive(e.to_string())),
    };
    if content.is_empty() {
        let _ = fs::remove_file(&latest);
        return Ok(None);
    }

    let stamp = OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .map_err(|e| LogError::Archive(e.to_string()))?;
    let mut target = logs_dir.join(format!("{ARCHIVE_PREFIX}{stamp}.zip"));
    let mut n = 1;
    while target.exists() {
        target = logs_dir.join(format!("{ARCHIVE_PREFIX}{stamp}_{n}.zip"));
        n += 1;
    }

    write_zip(&target, &format!("{stamp}.log"), &content)
        .map_err(|e| LogError::Archive(e.to_string()))?;
    fs::remove_file(&latest).map_err(|e| LogError::Archive(e.to_string()))?;
    prune_archives(logs_dir, KEEP_ARCHIVES);
    Ok(Some(target))
}

fn write_zip(target: &Path, entry: &str, content: &[u8]) -> zip::result::ZipResult<()> {
    use std::io::Write;

    let mut zip = zip::ZipWriter::new(fs::File::create(target)?);
    zip.start_file(
        entry,
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    zip.write_all(content)?;
    zip.finish()?;
    Ok(())
}

/// Deletes the oldest `log_*.zip` files beyond `keep`. Names sort by time.
fn prune_archives(logs_dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };
    let mut archives: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(".zip"))
        })
        .collect();
    if archives.len() <= keep {
        return;
    }
    archives.sort();
    let excess = archives.len() - keep;
    for old in archives.into_iter().take(excess) {
        let _ = fs::remove_file(old);
    }
}
