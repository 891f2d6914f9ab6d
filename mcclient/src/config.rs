//! Configuration for the multi-cluster client
//!
//! Settings are resolved in order, later sources winning:
//! 1. Default values
//! 2. Configuration file (TOML format)
//! 3. Environment variables
//!
//! The binary applies its command line flags on top.

use crate::aggregate::AggregateSettings;
use crate::credentials::CredentialSettings;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "MCCLIENT_CONFIG";

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McConfig {
    /// Management cluster and credential records
    #[serde(default)]
    pub management: ManagementConfig,
    /// Cross-cluster list/watch tuning
    #[serde(default)]
    pub aggregate: AggregateSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Management cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Kubeconfig for the management cluster; inferred when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context for the management cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// How long to wait for the first full credential list
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    #[serde(flatten)]
    pub credentials: CredentialSettings,
}

fn default_sync_timeout_secs() -> u64 {
    30
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            sync_timeout_secs: default_sync_timeout_secs(),
            credentials: CredentialSettings::default(),
        }
    }
}

impl ManagementConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

impl McConfig {
    /// Load from the first config file found, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like `load`, but an explicit path takes precedence over the search
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(Self::find_config_file);

        let mut config = match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                Self::load_from_file(&path)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var(CONFIG_ENV).ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/mcclient/config.toml")),
            Some(PathBuf::from("./mcclient.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `MCCLIENT_*` overrides from `lookup`. Unparsable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Management cluster
        if let Some(path) = lookup("MCCLIENT_KUBECONFIG") {
            self.management.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(context) = lookup("MCCLIENT_CONTEXT") {
            self.management.context = Some(context);
        }
        if let Some(secs) = lookup("MCCLIENT_SYNC_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.management.sync_timeout_secs = secs;
        }

        // Credential records
        let credentials = &mut self.management.credentials;
        if let Some(namespace) = lookup("MCCLIENT_NAMESPACE") {
            credentials.namespace = namespace;
        }
        if let Some(prefix) = lookup("MCCLIENT_NAME_PREFIX") {
            credentials.name_prefix = prefix;
        }
        if let Some(key) = lookup("MCCLIENT_CONFIG_KEY") {
            credentials.config_key = key;
        }
        if let Some(key) = lookup("MCCLIENT_CONTEXT_KEY") {
            credentials.context_key = key;
        }

        // Aggregation
        if let Some(n) = lookup("MCCLIENT_LIST_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.aggregate.list_concurrency = n;
        }
        if let Some(n) = lookup("MCCLIENT_WATCH_CHANNEL_CAPACITY").and_then(|v| v.parse().ok()) {
            self.aggregate.watch_channel_capacity = n;
        }

        // Logging
        if let Some(level) = lookup("MCCLIENT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(dir) = lookup("MCCLIENT_LOG_DIR") {
            self.logging.file_path = Some(PathBuf::from(dir));
        }
        if let Some(json) = lookup("MCCLIENT_LOG_JSON") {
            self.logging.json_format = json.parse().unwrap_or(false);
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let credentials = &self.management.credentials;

        mcclient_common::validate_namespace(&credentials.namespace)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if credentials.name_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "Credential name prefix cannot be empty".to_string(),
            ));
        }

        if credentials.config_key.is_empty() {
            return Err(ConfigError::Validation(
                "Credential config key cannot be empty".to_string(),
            ));
        }

        if self.aggregate.list_concurrency == 0 {
            return Err(ConfigError::Validation(
                "List concurrency must be at least 1".to_string(),
            ));
        }

        if self.aggregate.watch_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "Watch channel capacity must be at least 1".to_string(),
            ));
        }

        if self.management.sync_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Sync timeout must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {reason}")]
    FileRead { path: PathBuf, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Config validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for crate::McError {
    fn from(err: ConfigError) -> Self {
        crate::McError::Settings(err.to_string())
    }
}
