//! # Logging Utilities
//!
//! Logging infrastructure for xedbg using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Pretty output for humans and JSON output for tooling
//! - Environment variable configuration
//! - Optional file output next to the console
//! - Quiet, captured output for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xedbg_utils::init_logging;
//!
//! // Reads RUST_LOG, XEDBG_LOG_FORMAT and XEDBG_LOG_FILE
//! let _guard = init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("debugger attached");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Log filter (e.g. `debug`, `xedbg_core::processor=trace`)
//! - `XEDBG_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `XEDBG_LOG_FILE`: Optional path of a daily rolling log file
//!
//! Keep the returned [`LoggingGuard`] alive for as long as file output is
//! wanted; dropping it flushes and stops the background writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const ENV_LOG_FORMAT: &str = "XEDBG_LOG_FORMAT";
/// Environment variable naming a log file.
pub const ENV_LOG_FILE: &str = "XEDBG_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    Pretty,
    /// JSON format, one object per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
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
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Keeps background log writers alive.
#[derive(Debug, Default)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// ## Example
///
/// ```rust,no_run
/// use xedbg_utils::init_logging;
///
/// let _guard = init_logging().expect("Failed to initialize logging");
/// tracing::info!("guest launched");
/// ```
///
/// ## Errors
///
/// Returns an error if:
/// - `XEDBG_LOG_FORMAT` holds an unknown format
/// - A global subscriber is already installed
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(ENV_LOG_FORMAT) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::Pretty,
    };
    let directives = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| Level::INFO.to_string());
    let log_file = env::var(ENV_LOG_FILE).ok().map(PathBuf::from);
    init_with_directives(format, &directives, log_file.as_deref())
}

/// Initialize logging with an explicit level and format
///
/// `XEDBG_LOG_FILE` is still honoured.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let log_file = env::var(ENV_LOG_FILE).ok().map(PathBuf::from);
    init_with_directives(format, &Level::from(level).to_string(), log_file.as_deref())
}

/// Initialize file-only logging, leaving stdout to the caller
///
/// The file is created under `directory` as `YYYY-MM-DD-xedbg.log` and its
/// path is returned with the guard.
///
/// ## Errors
///
/// Returns an error if the directory cannot be created or a global
/// subscriber is already installed.
pub fn init_logging_to_file(directory: &Path, level: LogLevel) -> Result<(PathBuf, LoggingGuard), LoggingError>
{
    std::fs::create_dir_all(directory)?;
    let log_file = directory.join(format!("{}-xedbg.log", Utc::now().format("%Y-%m-%d")));
    let appender = tracing_appender::rolling::never(directory, log_file.file_name().unwrap_or_default());
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::new(Level::from(level).to_string());

    Registry::default()
        .with(fmt_layer(LogFormat::Pretty, writer, false).with_filter(filter))
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok((log_file, LoggingGuard { _file: Some(guard) }))
}

/// Route log output into the test harness's captured output
///
/// Safe to call from every test; only the first call installs the
/// subscriber. `RUST_LOG` selects the filter (default `warn`).
pub fn init_test_logging()
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}

fn init_with_directives(
    format: LogFormat,
    directives: &str,
    log_file: Option<&Path>,
) -> Result<LoggingGuard, LoggingError>
{
    let console = fmt_layer(format, io::stdout, true).with_filter(EnvFilter::new(directives));
    let mut layers: Vec<BoxedLayer> = vec![console.boxed()];

    let guard = match log_file {
        Some(path) => {
            let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let appender = tracing_appender::rolling::daily(directory, path.file_name().unwrap_or_default());
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt_layer(format, writer, false).with_filter(EnvFilter::new(directives)).boxed());
            Some(guard)
        }
        None => None,
    };

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(LoggingGuard { _file: guard })
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0} (use 'pretty' or 'json')")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0} (use 'error', 'warn', 'info', 'debug' or 'trace')")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("text").unwrap(), LogFormat::Pretty);
        assert!(matches!(LogFormat::from_str("xml"), Err(LoggingError::InvalidFormat(value)) if value == "xml"));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_init_test_logging_is_reentrant()
    {
        init_test_logging();
        init_test_logging();
        tracing::warn!("captured by the test harness");
    }
}
