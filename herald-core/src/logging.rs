//! Logging bootstrap for herald, built on the `tracing` ecosystem.
//!
//! Console output always; optional daily-rolled file output in text or JSON.
//! The non-blocking file writer hands back a guard that must live as long as
//! the process, held in a module static.

use std::io::stdout;
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::error::{CoreError, LoggingError};

/// Keeps the file writer flushing for the lifetime of the process.
static FILE_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

/// Minimal stderr logging for tests and early startup. Filter comes from
/// `RUST_LOG`, defaulting to `info`. Repeat calls are harmless.
pub fn init_minimal_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));
    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .try_init();
}

fn parse_level(level: &str) -> Result<Level, LoggingError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(LoggingError::Filter(format!("unknown log level: {other}"))),
    }
}

fn file_layer(
    path: &Path,
    format: &str,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync + 'static>, WorkerGuard), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|source| CoreError::Filesystem {
                message: "failed to create log directory".into(),
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    let appender = tracing_appender::rolling::daily(
        path.parent().unwrap_or_else(|| Path::new(".")),
        path.file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("herald.log")),
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync + 'static> = match format {
        "json" => Box::new(fmt::layer().json().with_writer(writer).with_ansi(false)),
        _ => Box::new(fmt::layer().with_writer(writer).with_ansi(false)),
    };
    Ok((layer, guard))
}

/// Installs the global subscriber from `config`.
///
/// Fails if the level string is invalid or a subscriber is already set (the
/// latter is tolerated when `is_reload` is true, since the process may be
/// re-reading its configuration).
pub fn init_logging(config: &LoggingConfig, is_reload: bool) -> Result<(), CoreError> {
    let level = parse_level(&config.level)?;

    let console_filter = EnvFilter::new(level.to_string());
    let console_layer: Box<dyn Layer<Registry> + Send + Sync + 'static> =
        match config.format.to_lowercase().as_str() {
            "json" => Box::new(
                fmt::layer()
                    .json()
                    .with_writer(stdout)
                    .with_ansi(false)
                    .with_filter(console_filter),
            ),
            _ => Box::new(
                fmt::layer()
                    .with_writer(stdout)
                    .with_ansi(atty::is(atty::Stream::Stdout))
                    .with_filter(console_filter),
            ),
        };

    let mut layers = vec![console_layer];
    let mut new_guard = None;
    if let Some(path) = &config.file_path {
        let (layer, guard) = file_layer(path, &config.format.to_lowercase())?;
        let filter = EnvFilter::new(level.to_string());
        layers.push(Box::new(layer.with_filter(filter)));
        new_guard = Some(guard);
    }

    let result = Registry::default().with(layers).try_init();

    if let Ok(mut slot) = FILE_GUARD.lock() {
        // Dropping the previous guard flushes the old file writer.
        *slot = new_guard;
    }

    match result {
        Ok(()) => Ok(()),
        Err(e) if is_reload => {
            tracing::info!("logging re-initialization skipped, subscriber already set: {e}");
            Ok(())
        }
        Err(e) => Err(CoreError::Logging(LoggingError::Initialization(format!(
            "failed to set global subscriber: {e}"
        )))),
    }
}
