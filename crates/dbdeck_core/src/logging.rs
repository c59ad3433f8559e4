//! Logging setup for hosts embedding the core.
//!
//! The core only emits `tracing` events. The host calls [`init_logging`]
//! once at startup; interactive terminals get stdout only, everything else
//! gets stdout (capped at INFO) plus a daily rotated file under the data
//! directory. If the file sink cannot be created the host still gets
//! console output.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter override.
pub const LOG_ENV_VAR: &str = "DBDECK_LOG";

const LOG_FILE_PREFIX: &str = "dbdeck";

/// Rotated files kept on disk.
const MAX_LOG_FILES: usize = 14;

/// Driver crates that are chatty at debug level.
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "russh=warn", "russh_keys=warn", "hyper=warn"];

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Console,
    ConsoleAndFile(PathBuf),
}

/// Which setting produced the active filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Custom,
    DbdeckLog,
    RustLog,
    BuildDefault,
}

pub struct LogConfig {
    /// `None` disables the file sink.
    pub log_dir: Option<PathBuf>,
    /// Set when stdout is a terminal; file output is skipped then.
    pub interactive: bool,
    pub log_filter: Option<String>,
}

impl LogConfig {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir: Some(log_dir), interactive: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Console output only, regardless of terminal detection.
    pub fn console() -> Self {
        Self { log_dir: None, interactive: true, log_filter: None }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn sink(&self) -> LogSink {
        match &self.log_dir {
            Some(dir) if !self.interactive => LogSink::ConsoleAndFile(dir.clone()),
            _ => LogSink::Console,
        }
    }
}

/// Keeps the background file writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
    pub sink: LogSink,
}

/// Install the global subscriber.
///
/// A subscriber installed earlier (by the host or a test harness) is left
/// in place.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let (filter, source) = resolve_filter(config.log_filter.as_deref(), |key| std::env::var(key).ok());

    let guard = match config.sink() {
        LogSink::Console => console_subscriber(filter),
        LogSink::ConsoleAndFile(dir) => match file_subscriber(&dir, filter) {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("dbdeck: file logging unavailable in {}: {e}; logging to console", dir.display());
                let (filter, _) = resolve_filter(config.log_filter.as_deref(), |key| std::env::var(key).ok());
                console_subscriber(filter)
            }
        },
    };

    tracing::info!(sink = ?guard.sink, filter_source = ?source, "Logging initialized");
    guard
}

/// [`init_logging`] with the platform log directory.
pub fn init_logging_default() -> LoggingGuard {
    init_logging(LogConfig::new(log_dir()))
}

fn console_subscriber(filter: EnvFilter) -> LoggingGuard {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .with_target(false)
        .try_init();
    LoggingGuard { _worker_guard: None, sink: LogSink::Console }
}

fn file_subscriber(
    dir: &std::path::Path,
    filter: EnvFilter,
) -> Result<LoggingGuard, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?;
    let (file_writer, worker_guard) = tracing_appender::non_blocking(appender);
    let writer = std::io::stdout.with_max_level(tracing::Level::INFO).and(file_writer);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .try_init()?;

    Ok(LoggingGuard { _worker_guard: Some(worker_guard), sink: LogSink::ConsoleAndFile(dir.to_path_buf()) })
}

/// Pick the filter: custom, then `DBDECK_LOG`, then `RUST_LOG`, then the
/// build default. Unparseable values fall through to the next candidate.
fn resolve_filter(custom: Option<&str>, env: impl Fn(&str) -> Option<String>) -> (EnvFilter, FilterSource) {
    let candidates = [
        (custom.map(str::to_string), FilterSource::Custom),
        (env(LOG_ENV_VAR), FilterSource::DbdeckLog),
        (env("RUST_LOG"), FilterSource::RustLog),
    ];

    candidates
        .into_iter()
        .find_map(|(directives, source)| {
            let directives = directives.filter(|d| !d.trim().is_empty())?;
            EnvFilter::try_new(directives).ok().map(|filter| (filter, source))
        })
        .unwrap_or_else(|| (EnvFilter::new(default_log_filter()), FilterSource::BuildDefault))
}

/// Build-type default: trace for this crate in debug builds, with the
/// driver crates held at warn.
pub fn default_log_filter() -> String {
    let (global, own) = if cfg!(debug_assertions) { ("debug", "trace") } else { ("info", "info") };
    let mut directives = vec![global.to_string(), format!("dbdeck_core={own}")];
    directives.extend(QUIET_TARGETS.iter().map(|d| d.to_string()));
    directives.join(",")
}

/// `./dbdeck_data/logs` in debug builds, the platform data dir otherwise.
pub fn log_dir() -> PathBuf {
    if cfg!(debug_assertions) {
        return PathBuf::from("./dbdeck_data/logs");
    }
    dirs::data_dir()
        .map(|d| d.join("dbdeck"))
        .unwrap_or_else(|| PathBuf::from("./dbdeck_data"))
        .join("logs")
}
