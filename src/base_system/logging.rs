//! Logging bootstrap: a level-switched console layer plus a debug-level file
//! layer under `logs/`, with the previous run's log compressed away on exit.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{panic, thread, time::Duration};

use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{error, info};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use zip::write::FileOptions;
use zip::CompressionMethod;

const LOGS_DIR: &str = "logs";
const LIVE_LOG_NAME: &str = "scramdl.log";

/// A live log that grew past this is rotated out at the next startup even if
/// the previous run never exited cleanly.
const ROTATE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// The non-blocking writer needs a moment to release its handle on Windows
/// before the file can be rotated.
const WRITER_SETTLE: Duration = Duration::from_millis(1000);

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("time formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    pub debug: bool,
    pub use_color: bool,
    pub archive_on_exit: bool,
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: true,
            console: true,
        }
    }
}

pub struct LogSystem {
    runtime: Arc<LogRuntime>,
}

impl LogSystem {
    pub fn init(options: LogOptions) -> Result<Self, LogError> {
        let logs_dir = PathBuf::from(LOGS_DIR);
        fs::create_dir_all(&logs_dir)?;
        let live_log = logs_dir.join(LIVE_LOG_NAME);

        // A leftover oversized log means the last run died before rotating.
        if fs::metadata(&live_log).map(|m| m.len() >= ROTATE_THRESHOLD).unwrap_or(false) {
            rotate_log(&live_log, &logs_dir)?;
        }

        let file_appender = rolling::never(&logs_dir, LIVE_LOG_NAME);
        let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .finish(file_appender);

        let console_level = if options.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };

        let console_writer: BoxMakeWriter = if options.console {
            BoxMakeWriter::new(io::stderr)
        } else {
            BoxMakeWriter::new(io::sink)
        };

        let console_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_thread_names(true)
            .with_ansi(options.use_color)
            .with_writer(console_writer)
            .with_filter(console_level);

        let file_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_writer)
            .with_filter(LevelFilter::DEBUG);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("global subscriber") || msg.contains("already") {
                    LogError::AlreadyInitialized
                } else {
                    LogError::SubscriberInit(e)
                }
            })?;

        let runtime = Arc::new(LogRuntime {
            logs_dir,
            live_log,
            guard: Mutex::new(Some(guard)),
            exit_called: AtomicBool::new(false),
            archive_on_exit: options.archive_on_exit,
        });

        runtime.install_panic_hook();

        Ok(Self { runtime })
    }

    pub fn safe_exit(&self) {
        self.runtime.safe_exit();
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.runtime.safe_exit();
    }
}

struct LogRuntime {
    logs_dir: PathBuf,
    live_log: PathBuf,
    guard: Mutex<Option<WorkerGuard>>,
    exit_called: AtomicBool,
    archive_on_exit: bool,
}

impl LogRuntime {
    fn install_panic_hook(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                error!("panic at {}:{}: {}", location.file(), location.line(), info);
            } else {
                error!("panic: {info}");
            }
            runtime.safe_exit();
            previous(info);
        }));
    }

    fn safe_exit(&self) {
        if self.exit_called.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }

        thread::sleep(WRITER_SETTLE);

        if self.archive_on_exit {
            if let Err(err) = rotate_log(&self.live_log, &self.logs_dir) {
                eprintln!("failed to rotate log: {err}");
            }
        }
    }
}

/// Compress the live log into a timestamped `scramdl_<stamp>.zip` beside it
/// and remove the original, leaving the next run a fresh file. A missing or
/// empty log is simply cleaned up.
fn rotate_log(live_log: &Path, logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let contents = match fs::read(live_log) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if contents.is_empty() {
        let _ = fs::remove_file(live_log);
        return Ok(None);
    }

    let stamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let archive = logs_dir.join(format!("scramdl_{stamp}.zip"));

    let mut writer = zip::ZipWriter::new(File::create(&archive)?);
    writer.start_file(
        format!("scramdl_{stamp}.log"),
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    writer.write_all(&contents)?;
    writer.finish()?;

    let _ = fs::remove_file(live_log);
    info!("previous log rotated into {}", archive.display());
    Ok(Some(archive))
}
