//! Queue and worker configuration for the usage pipeline.
//!
//! These settings govern lease-based delivery: how long a dequeued message stays
//! invisible to other workers, how many failed deliveries are tolerated before a
//! message is dead-lettered, and how workers poll.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Work queue and worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Failed deliveries tolerated before a message moves to the dead-letter queue
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Visibility lease duration in milliseconds
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    /// Maximum messages leased per dequeue
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Idle wait between empty polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of workers per consumer pool
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_visibility_timeout_ms() -> u64 {
    30000
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    2
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_receive_count: default_max_receive_count(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_parse::<u32>("QUEUE_MAX_RECEIVE_COUNT")? {
            config.max_receive_count = value;
        }
        if let Some(value) = env_parse::<u64>("QUEUE_VISIBILITY_TIMEOUT_MS")? {
            config.visibility_timeout_ms = value;
        }
        if let Some(value) = env_parse::<usize>("QUEUE_BATCH_SIZE")? {
            config.batch_size = value;
        }
        if let Some(value) = env_parse::<u64>("QUEUE_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = value;
        }
        if let Some(value) = env_parse::<usize>("QUEUE_WORKERS")? {
            config.workers = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Get the visibility lease duration
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Get the idle poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "visibility_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.workers == 0 {
            return Err(ConfigError::MissingRequired(
                "workers (at least one worker per pool)".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_receive_count, 3);
        assert_eq!(config.visibility_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = QueueConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "batch_size"
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = QueueConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }
}
