//! # Logging Utilities
//!
//! `tracing` subscriber setup for the snare binaries.
//!
//! The engine logs through `tracing` with structured fields (`pid`, `tid`,
//! `address`, `base`); this module decides where those records go:
//! - Human-readable or JSON lines
//! - Console, console plus a daily rolling file, or a file only
//! - Level filtering through `RUST_LOG` or an explicit [`LogLevel`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snare_utils::init_logging;
//!
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `debug`, `snare_core=trace`)
//! - `SNARE_LOG_FORMAT`: `pretty` (default) or `json`
//! - `SNARE_LOG_FILE`: also write records to this file (rolled daily)
//!
//! ## File-only Output
//!
//! Consumers whose stdout is their product (the tracer prints one line per
//! function entry) log to a file instead:
//!
//! ```rust,no_run
//! use snare_utils::{LogFormat, LogLevel, init_logging_to_file};
//!
//! let (path, _guard) = init_logging_to_file(Some(LogLevel::Debug), LogFormat::Json)
//!     .expect("Failed to initialize logging");
//! eprintln!("logging to {}", path.display());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_VAR: &str = "SNARE_LOG_FORMAT";
/// Environment variable naming an additional log file.
pub const LOG_FILE_VAR: &str = "SNARE_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per record
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel
{
    /// Fatal conditions only
    Error,
    /// Protocol misuse and recoverable failures
    Warn,
    /// Lifecycle transitions (default)
    #[default]
    Info,
    /// Event decoding and parse failures
    Debug,
    /// Memory traffic
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Keeps background log writers alive
///
/// File output goes through a non-blocking writer; records still queued are
/// flushed when the guard is dropped, so hold it until the program exits.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment.
///
/// Console output is always on; `SNARE_LOG_FILE` adds a daily rolling file.
///
/// ## Errors
///
/// - `LoggingError::InvalidFormat`: `SNARE_LOG_FORMAT` is not `pretty` or `json`
/// - `LoggingError::InitializationFailed`: a global subscriber is already set
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(LOG_FORMAT_VAR) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::default(),
    };
    init_console(format, None)
}

/// Initialize logging with an explicit level (overrides `RUST_LOG`).
///
/// ## Errors
///
/// - `LoggingError::InitializationFailed`: a global subscriber is already set
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    init_console(format, Some(level.into()))
}

/// Initialize file-only logging and return the file's path.
///
/// The file is `SNARE_LOG_FILE` when set, otherwise
/// `<temp dir>/snare/YYYY-MM-DD-snare.log`. `level` overrides `RUST_LOG`.
///
/// ## Errors
///
/// - `LoggingError::FileError`: the log directory could not be created
/// - `LoggingError::InitializationFailed`: a global subscriber is already set
pub fn init_logging_to_file(level: Option<LogLevel>, format: LogFormat) -> Result<(PathBuf, LoggingGuard), LoggingError>
{
    let path = env::var_os(LOG_FILE_VAR).map_or_else(default_log_file, PathBuf::from);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let appender = tracing_appender::rolling::never(directory_of(&path), file_name_of(&path));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = format_layer(format, writer, false, filter(level.map(Into::into)));

    install(vec![layer])?;
    Ok((path, LoggingGuard { _file: Some(guard) }))
}

fn init_console(format: LogFormat, level: Option<Level>) -> Result<LoggingGuard, LoggingError>
{
    let mut layers = vec![format_layer(format, io::stdout, true, filter(level))];
    let mut guard = LoggingGuard::default();

    if let Some(path) = env::var_os(LOG_FILE_VAR).map(PathBuf::from) {
        let appender: RollingFileAppender = tracing_appender::rolling::daily(directory_of(&path), file_name_of(&path));
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(format, writer, false, filter(level)));
        guard._file = Some(file_guard);
    }

    install(layers)?;
    Ok(guard)
}

/// Explicit level first, then `RUST_LOG`, then `info`.
fn filter(level: Option<Level>) -> EnvFilter
{
    match level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
    }
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());

    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn install(layers: Vec<BoxedLayer>) -> Result<(), LoggingError>
{
    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))
}

fn default_log_file() -> PathBuf
{
    let today = Utc::now().format("%Y-%m-%d");
    env::temp_dir().join("snare").join(format!("{today}-snare.log"))
}

fn directory_of(path: &Path) -> PathBuf
{
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn file_name_of(path: &Path) -> PathBuf
{
    path.file_name().map_or_else(|| PathBuf::from("snare.log"), PathBuf::from)
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// A global subscriber is already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// Log file could not be prepared
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
