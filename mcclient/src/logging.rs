//! Logging setup
//!
//! Console output on stderr plus optional rolling JSON file output.
//! `RUST_LOG` takes precedence over the configured level.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "mc-controller.log";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for rolling log files; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub rotation: LogRotation,
    /// JSON console output
    #[serde(default)]
    pub json_format: bool,
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_path: None,
            rotation: LogRotation::Daily,
            json_format: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    Filter(String, String),

    #[error("Failed to initialize logging: {0}")]
    Init(String),
}

impl LoggingConfig {
    /// Filter from `RUST_LOG`, falling back to the configured level
    pub fn filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| LoggingError::Filter(self.level.clone(), e.to_string())),
        }
    }

    /// Install the global subscriber.
    ///
    /// The returned guard flushes file output when dropped; keep it alive
    /// for the lifetime of the process.
    pub fn init(&self) -> Result<Option<WorkerGuard>, LoggingError> {
        let filter = self.filter()?;

        let console = if self.json_format {
            fmt::layer().json().with_writer(io::stderr).boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(io::stderr)
                .boxed()
        };

        let (file_layer, guard) = match &self.file_path {
            Some(dir) => {
                let appender = match self.rotation {
                    LogRotation::Hourly => rolling::hourly(dir, LOG_FILE_NAME),
                    LogRotation::Daily => rolling::daily(dir, LOG_FILE_NAME),
                    LogRotation::Never => rolling::never(dir, LOG_FILE_NAME),
                };
                let (writer, guard) = non_blocking(appender);

                let layer = fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))?;

        tracing::debug!(level = %self.level, file = ?self.file_path, "Logging initialized");
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_parse_from_toml() {
        let config: LoggingConfig = toml::from_str(
            r#"
            level = "mcclient=debug,kube=warn"
            file_path = "/var/log/mcclient"
            rotation = "hourly"
            "#,
        )
        .unwrap();

        assert_eq!(config.rotation, LogRotation::Hourly);
        assert_eq!(config.file_path, Some(PathBuf::from("/var/log/mcclient")));
        assert!(!config.json_format);
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LoggingConfig {
            level: "mcclient=verbose".to_string(),
            ..Default::default()
        };

        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(config.filter(), Err(LoggingError::Filter(..))));
        }
    }
}
