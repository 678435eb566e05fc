//! Tracing setup.
//!
//! The filter comes from the command line when given, then from
//! `TASKBOARD_LOG`, then from the configured level. Output goes to stderr, or to a file when one is given;
//! the terminal board always uses a file so log lines never land on screen.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogConfig, LogFormat};
use crate::error::ConfigError;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "TASKBOARD_LOG";

/// Build the filter from the environment, falling back to `level`.
pub fn filter(level: &str) -> Result<EnvFilter, ConfigError> {
    match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => {
            EnvFilter::try_new(directive).map_err(|e| ConfigError::LogFilter(e.to_string()))
        }
        _ => EnvFilter::try_new(level).map_err(|e| ConfigError::LogFilter(e.to_string())),
    }
}

/// Install the global subscriber.
///
/// `file` overrides the configured log file and `level` overrides both the
/// environment and the configured level.
pub fn init(config: &LogConfig, file: Option<&Path>, level: Option<&str>) -> Result<(), ConfigError> {
    let env_filter = match level {
        Some(level) => EnvFilter::try_new(level).map_err(|e| ConfigError::LogFilter(e.to_string()))?,
        None => filter(&config.level)?,
    };

    let (writer, ansi) = match file.or(config.file.as_deref()) {
        Some(path) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ConfigError::LogFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(true);
            registry.with(layer).try_init()
        }
        LogFormat::Compact => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(false);
            registry.with(layer).try_init()
        }
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true);
            registry.with(layer).try_init()
        }
    };
    result.map_err(|e| ConfigError::LogInit(e.to_string()))
}
