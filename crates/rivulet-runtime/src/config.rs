//! Configuration file support for the rivulet runtime
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! broker:
//!   default_queue_capacity: 1024
//!
//! state:
//!   backend: file
//!   data_dir: /var/lib/rivulet/state
//!   max_checkpoints: 3
//!
//! connections:
//!   memory:
//!     edge:
//!       prefix: edge
//!       capacity: 256
//! ```

use crate::connector::ConnectorCatalog;
use crate::persistence::StateConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub broker: BrokerConfig,

    /// Checkpoint state storage
    pub state: StateConfig,

    /// Shared connections by connector type and key
    pub connections: ConnectorCatalog,
}

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Queue capacity of subscribers that do not ask for one
    pub default_queue_capacity: usize,

    /// Queue capacity of lookup table feeders
    pub feeder_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_queue_capacity: 1024,
            feeder_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let config = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.default_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.default_queue_capacity must be positive".to_string(),
            ));
        }
        if self.broker.feeder_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.feeder_capacity must be positive".to_string(),
            ));
        }
        if self.state.max_checkpoints == 0 {
            return Err(ConfigError::Invalid(
                "state.max_checkpoints must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
