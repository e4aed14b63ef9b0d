//! Logging setup for the inference dispatcher
//!
//! Installs a global `tracing` subscriber from [`LoggingSettings`]: an
//! `EnvFilter` seeded from the configured level (`RUST_LOG` wins when set),
//! human-readable or JSON output, and an optional daily-rotated log file.

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use common::error::{Error, Result};
use orchestrator_config::LoggingSettings;

/// Keeps the background log writer alive. Dropping it flushes and stops
/// file logging.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Builds the filter from `RUST_LOG`, falling back to the configured level
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    resolve_filter(from_env.as_deref(), settings)
}

/// An unset, blank or unparsable override falls back to `settings.level`
fn resolve_filter(override_directive: Option<&str>, settings: &LoggingSettings) -> Result<EnvFilter> {
    if let Some(directive) = override_directive.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directive) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(&settings.level)
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", settings.level, e)))
}

/// Initializes logging. Must be called at most once per process.
pub fn init_logging(settings: &LoggingSettings) -> Result<LoggingGuard> {
    // Route `log` records from dependencies into tracing
    let _ = tracing_log::LogTracer::init();

    let filter = build_filter(settings)?;

    let (file_layer, file_guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = if settings.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install subscriber: {}", e)))?;

    info!(
        level = %settings.level,
        json = settings.json,
        file = settings.directory.is_some(),
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
