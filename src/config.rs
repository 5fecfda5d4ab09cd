use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cube::duration;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid cube: {0}")]
    InvalidCube(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub prometheus: PrometheusConfig,
    pub clickhouse: ClickHouseConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    pub url: String,
    /// Resolution of range queries.
    #[serde(with = "duration")]
    pub step: Duration,
    /// Evaluation timeout passed to Prometheus with every query.
    #[serde(with = "duration")]
    pub timeout: Duration,
    pub insecure: bool,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            step: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            insecure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between two passes over the cube list.
    #[serde(rename = "poll-interval", with = "duration")]
    pub poll_interval: Duration,
    /// How far back the first cycle of a cube reaches.
    #[serde(with = "duration")]
    pub lookback: Duration,
    /// Deadline for every single source or store call.
    #[serde(rename = "call-timeout", with = "duration")]
    pub call_timeout: Duration,
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            lookback: Duration::from_secs(60 * 60),
            call_timeout: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("batch-size must be positive".to_string()));
        }
        if self.prometheus.step.is_zero() {
            return Err(ConfigError::Invalid("prometheus step must be positive".to_string()));
        }
        if self.scheduler.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("call-timeout must be positive".to_string()));
        }
        Ok(())
    }
}
