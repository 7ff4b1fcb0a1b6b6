use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the workflow host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Steps of one instance allowed to run at the same time
    pub max_parallel_steps: usize,
    pub event_buffer_size: usize,
    /// How long `stop()` waits for in-flight steps before aborting them
    pub shutdown_timeout_ms: u64,
}

impl HostConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_toml(&text)?)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 10,
            event_buffer_size: 1000,
            shutdown_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
