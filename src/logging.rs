//! Structured logging and diagnostics for mentor.
//!
//! Connection, transfer and port-mapping events are emitted as `tracing`
//! events with structured fields (`connection`, `peer`, `path`, ...). Output
//! goes to stderr at the chosen verbosity and, optionally, to a log file that
//! always records debug detail.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only
    Quiet,
    /// Normal logging (info level)
    #[default]
    Normal,
    /// Verbose logging (debug level)
    Verbose,
    /// Very verbose logging (trace level)
    Trace,
}

impl Verbosity {
    /// Map `-q` / `-v` counts from the command line to a verbosity.
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        match (quiet, verbose) {
            (true, _) => Verbosity::Quiet,
            (false, 0) => Verbosity::Normal,
            (false, 1) => Verbosity::Verbose,
            (false, _) => Verbosity::Trace,
        }
    }

    /// Get the tracing level filter for this verbosity.
    pub fn as_level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }

    /// Get the tracing level for this verbosity.
    pub fn as_level(&self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level for stderr output.
    pub verbosity: Verbosity,
    /// Optional path to log file.
    pub log_file: Option<String>,
    /// Write the log file as JSON lines instead of text.
    pub json: bool,
}

/// Guard that must be kept alive for the duration of logging.
///
/// When this guard is dropped, the logging system will flush pending logs.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            _file_guard: file_guard,
        }
    }
}

/// Initialize the logging system.
///
/// Returns a guard that must be kept alive for the duration of logging.
/// `RUST_LOG` overrides the stderr level chosen by `config.verbosity`. Calling this
/// twice leaves the first subscriber in place.
///
/// # Example
///
/// ```ignore
/// use mentor::logging::{init_logging, LogConfig, Verbosity};
///
/// let config = LogConfig {
///     verbosity: Verbosity::Verbose,
///     log_file: Some("/tmp/mentor.log".to_string()),
///     json: false,
/// };
/// let _guard = init_logging(&config);
/// tracing::info!("Logging initialized");
/// ```
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.verbosity.as_level_filter().into())
        .from_env_lossy();

    let (text_file_layer, json_file_layer, file_guard) =
        if let Some(ref log_file_path) = config.log_file {
            let path = Path::new(log_file_path);
            let parent_dir = path.parent().unwrap_or(Path::new("."));
            let filename = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("mentor.log");

            let file_appender = tracing_appender::rolling::never(parent_dir, filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            if config.json {
                let layer = fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(non_blocking)
                    .with_filter(LevelFilter::DEBUG);
                (None, Some(layer), Some(guard))
            } else {
                let layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_timer(fmt::time::uptime())
                    .with_writer(non_blocking)
                    .with_filter(LevelFilter::DEBUG); // Always log at debug level to file
                (Some(layer), None, Some(guard))
            }
        } else {
            (None, None, None)
        };

    let stderr_layer = fmt::layer()
        .with_ansi(true)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(text_file_layer)
        .with(json_file_layer)
        .try_init();

    LogGuard::new(file_guard)
}
