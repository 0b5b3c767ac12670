use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

pub use tracing::{debug, error, info, instrument, trace, warn};

/// When the file appender starts a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<LogRotation> for rolling::Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => rolling::Rotation::HOURLY,
            LogRotation::Daily => rolling::Rotation::DAILY,
            LogRotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `netfs_client=debug,info`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,

    /// Directory for log files. No file logging when unset.
    pub log_dir: Option<PathBuf>,

    pub file_prefix: String,

    pub rotation: LogRotation,

    pub json_format: bool,

    pub console_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_dir: None,
            file_prefix: "netfs".into(),
            rotation: LogRotation::default(),
            json_format: false,
            console_output: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid log filter {0:?}: {1}")]
    Filter(String, String),
    #[error("cannot create log file appender: {0}")]
    Appender(#[from] rolling::InitError),
    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn filter_for(config: &LogConfig) -> Result<EnvFilter, LogError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LogError::Filter(config.level.clone(), e.to_string())),
    }
}

fn console_layer(config: &LogConfig) -> Option<BoxedLayer> {
    if !config.console_output {
        return None;
    }
    let layer: BoxedLayer = if config.json_format {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };
    Some(layer)
}

fn file_layer(config: &LogConfig) -> Result<Option<(BoxedLayer, WorkerGuard)>, LogError> {
    let Some(dir) = &config.log_dir else {
        return Ok(None);
    };
    let appender = rolling::RollingFileAppender::builder()
        .rotation(config.rotation.into())
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: BoxedLayer = if config.json_format {
        fmt::layer().json().with_writer(writer).with_ansi(false).boxed()
    } else {
        fmt::layer().with_writer(writer).with_ansi(false).boxed()
    };
    Ok(Some((layer, guard)))
}

/// Install the global subscriber. Call once at startup and keep the returned
/// guard alive for as long as file logging should keep flushing.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LogError> {
    let filter = filter_for(config)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.extend(console_layer(config));
    let guard = match file_layer(config)? {
        Some((layer, guard)) => {
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

    Ok(guard)
}
