//! State cache configuration
//!
//! All fields are optional in the YAML file; missing values take the
//! defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Tunables of the cluster state cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Upper bound on one provisioning batch; sizes the nomination window
    pub batch_max_duration_secs: u64,

    /// Quiet period that closes a provisioning batch
    pub batch_idle_duration_secs: u64,

    /// Consolidation state older than this is force-refreshed
    pub consolidation_timeout_secs: u64,

    /// Start complaining once unsynced for this long
    pub unsynced_log_after_secs: u64,

    /// Minimum gap between unsynced complaints
    pub unsynced_log_interval_secs: u64,

    /// Bound on each store sub-query
    pub store_timeout_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            batch_max_duration_secs: 10,
            batch_idle_duration_secs: 1,
            consolidation_timeout_secs: 300,
            unsynced_log_after_secs: 30,
            unsynced_log_interval_secs: 10,
            store_timeout_secs: 30,
        }
    }
}

/// Nominations never last less than this
const MIN_NOMINATION_WINDOW: Duration = Duration::from_secs(10);

impl StateConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: StateConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_max_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "batch_max_duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.batch_idle_duration_secs > self.batch_max_duration_secs {
            return Err(ConfigError::Invalid(format!(
                "batch_idle_duration_secs ({}) exceeds batch_max_duration_secs ({})",
                self.batch_idle_duration_secs, self.batch_max_duration_secs
            )));
        }
        if self.consolidation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "consolidation_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_max_duration(&self) -> Duration {
        Duration::from_secs(self.batch_max_duration_secs)
    }

    /// How long a nominated node stays reserved: twice the batch window, at least 10s
    pub fn nomination_window(&self) -> Duration {
        (self.batch_max_duration() * 2).max(MIN_NOMINATION_WINDOW)
    }

    pub fn consolidation_timeout(&self) -> Duration {
        Duration::from_secs(self.consolidation_timeout_secs)
    }

    pub fn unsynced_log_after(&self) -> Duration {
        Duration::from_secs(self.unsynced_log_after_secs)
    }

    pub fn unsynced_log_interval(&self) -> Duration {
        Duration::from_secs(self.unsynced_log_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

/// Load and validate a config file from disk
pub fn load_config_file(path: &Path) -> Result<StateConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    StateConfig::from_yaml(&content)
}

/// `~/.nodestate/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nodestate")
        .join("config.yaml")
}
