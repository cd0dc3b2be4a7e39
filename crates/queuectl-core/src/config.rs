use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueueCtlError, Result};

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> f64 {
    2.0
}
fn default_job_timeout() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    1
}
fn default_worker_shutdown_timeout() -> u64 {
    10
}

/// The five tunable runtime knobs, persisted as a flat JSON object.
///
/// Unknown keys present in the file on disk are preserved across a
/// load/save round-trip (see [`Config::load`]); missing keys are filled
/// with their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_worker_shutdown_timeout")]
    pub worker_shutdown_timeout: u64,

    /// Keys from the on-disk file that this version of queuectl doesn't
    /// recognize. Preserved verbatim on save.
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            job_timeout: default_job_timeout(),
            poll_interval: default_poll_interval(),
            worker_shutdown_timeout: default_worker_shutdown_timeout(),
            unknown: serde_json::Map::new(),
        }
    }
}

impl Config {
    /// Load from `path`, creating it with defaults if absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist to `path` as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate that the configured knobs fall within usable ranges.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base <= 0.0 {
            return Err(QueueCtlError::InvalidArgument(
                "backoff-base must be a positive number".into(),
            ));
        }
        if self.job_timeout == 0 {
            return Err(QueueCtlError::InvalidArgument(
                "job-timeout must be a positive integer".into(),
            ));
        }
        if self.poll_interval < 1 {
            return Err(QueueCtlError::InvalidArgument(
                "poll-interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    /// Set one kebab-case key (CLI form) to a raw string value, validating
    /// and type-converting it, then persist. Used by `config set`.
    pub fn set_key(&mut self, key: &str, raw_value: &str, path: impl AsRef<Path>) -> Result<()> {
        let mut candidate = self.clone();
        match key {
            "max-retries" => {
                candidate.max_retries = parse_u32(raw_value)?;
            }
            "backoff-base" => {
                candidate.backoff_base = raw_value.parse().map_err(|_| invalid(key, raw_value))?;
            }
            "job-timeout" => {
                candidate.job_timeout = parse_u64(raw_value)?;
            }
            "poll-interval" => {
                candidate.poll_interval = parse_u64(raw_value)?;
            }
            "worker-shutdown-timeout" => {
                candidate.worker_shutdown_timeout = parse_u64(raw_value)?;
            }
            other => {
                return Err(QueueCtlError::InvalidArgument(format!(
                    "invalid configuration key '{other}'"
                )))
            }
        }
        candidate.validate()?;
        candidate.save(path)?;
        *self = candidate;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("queuectl_config.json")
    }
}

fn invalid(key: &str, value: &str) -> QueueCtlError {
    QueueCtlError::InvalidArgument(format!("invalid value '{value}' for '{key}'"))
}

fn parse_u32(raw: &str) -> Result<u32> {
    raw.parse::<i64>()
        .ok()
        .filter(|v| *v >= 0)
        .map(|v| v as u32)
        .ok_or_else(|| {
            QueueCtlError::InvalidArgument("value must be a non-negative integer".into())
        })
}

fn parse_u64(raw: &str) -> Result<u64> {
    raw.parse::<i64>()
        .ok()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .ok_or_else(|| {
            QueueCtlError::InvalidArgument("value must be a non-negative integer".into())
        })
}
