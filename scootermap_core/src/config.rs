//! Engine configuration.
//!
//! Read once at startup. Changing the resolution set of a populated store
//! needs a backfill (every row carries one cell per configured resolution),
//! so there is no hot-reload path.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::spatial::ResolutionSet;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid resolution: {0} (H3 resolutions are 0..=15)")]
    InvalidResolution(u8),

    #[error("At least one resolution must be configured")]
    NoResolutions,

    #[error("Default resolution {0} is not in the configured set")]
    DefaultResolutionNotConfigured(u8),

    #[error("Retention horizon ({retention:?}) must be >= occupancy window ({window:?})")]
    RetentionShorterThanWindow { retention: Duration, window: Duration },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration for the aggregation worker and the query engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// H3 resolutions to index (default: [6, 7, 8, 9])
    pub resolutions: Vec<u8>,

    /// Resolution used when a query does not name one (default: 7)
    pub default_resolution: u8,

    /// Default presence horizon for occupancy queries (default: 5 min)
    #[serde(rename = "occupancyWindowSecs", with = "duration_secs")]
    pub occupancy_window: Duration,

    /// Rows older than this are physically deleted (default: 60 min)
    #[serde(rename = "retentionHorizonSecs", with = "duration_secs")]
    pub retention_horizon: Duration,

    /// Batch flush trigger by count (default: 1000)
    pub batch_size: usize,

    /// Batch flush trigger by time (default: 5 s)
    #[serde(rename = "batchFlushIntervalMs", with = "duration_millis")]
    pub batch_flush_interval: Duration,

    /// Retention sweep schedule (default: 60 s)
    #[serde(rename = "sweepIntervalSecs", with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Commit attempts per batch before it is surfaced as failed (default: 5)
    pub max_commit_attempts: u32,

    /// First retry delay; doubles per attempt (default: 100 ms)
    #[serde(rename = "retryBaseDelayMs", with = "duration_millis")]
    pub retry_base_delay: Duration,

    /// Ceiling for the retry delay (default: 5 s)
    #[serde(rename = "retryMaxDelayMs", with = "duration_millis")]
    pub retry_max_delay: Duration,

    /// Observations further than this ahead of the worker clock are rejected (default: 5 min)
    #[serde(rename = "maxFutureSkewSecs", with = "duration_secs")]
    pub max_future_skew: Duration,

    /// Bound on the store scan behind a query (default: 3 s)
    #[serde(rename = "queryTimeoutMs", with = "duration_millis")]
    pub query_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resolutions: vec![6, 7, 8, 9],
            default_resolution: 7,
            occupancy_window: Duration::from_secs(5 * 60),
            retention_horizon: Duration::from_secs(60 * 60),
            batch_size: 1000,
            batch_flush_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            max_commit_attempts: 5,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            max_future_skew: Duration::from_secs(5 * 60),
            query_timeout: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file. Missing keys take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the resolution set.
    pub fn with_resolutions(mut self, resolutions: impl Into<Vec<u8>>) -> Self {
        self.resolutions = resolutions.into();
        self
    }

    /// Sets the default query resolution.
    pub fn with_default_resolution(mut self, resolution: u8) -> Self {
        self.default_resolution = resolution;
        self
    }

    /// Sets the occupancy window.
    pub fn with_occupancy_window(mut self, window: Duration) -> Self {
        self.occupancy_window = window;
        self
    }

    /// Sets the retention horizon.
    pub fn with_retention_horizon(mut self, horizon: Duration) -> Self {
        self.retention_horizon = horizon;
        self
    }

    /// Sets the batch size flush trigger.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the time-based flush trigger.
    pub fn with_batch_flush_interval(mut self, interval: Duration) -> Self {
        self.batch_flush_interval = interval;
        self
    }

    /// Sets the retention sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the retry budget and backoff bounds.
    pub fn with_commit_retries(mut self, attempts: u32, base: Duration, max: Duration) -> Self {
        self.max_commit_attempts = attempts;
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    /// Validates the configuration and builds the resolution set.
    pub fn validate(&self) -> Result<ResolutionSet, ConfigError> {
        let resolutions = ResolutionSet::new(&self.resolutions)?;

        if !resolutions.contains(self.default_resolution) {
            return Err(ConfigError::DefaultResolutionNotConfigured(self.default_resolution));
        }
        if self.retention_horizon < self.occupancy_window {
            return Err(ConfigError::RetentionShorterThanWindow {
                retention: self.retention_horizon,
                window: self.occupancy_window,
            });
        }
        if self.occupancy_window.is_zero() {
            return Err(invalid("occupancyWindowSecs", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batchSize", "must be positive"));
        }
        if self.batch_flush_interval.is_zero() {
            return Err(invalid("batchFlushIntervalMs", "must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("sweepIntervalSecs", "must be positive"));
        }
        if self.max_commit_attempts == 0 {
            return Err(invalid("maxCommitAttempts", "must be at least 1"));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(invalid("retryMaxDelayMs", "must be >= retryBaseDelayMs"));
        }
        if self.query_timeout.is_zero() {
            return Err(invalid("queryTimeoutMs", "must be positive"));
        }

        Ok(resolutions)
    }

    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}

/// Milliseconds in `duration`, saturating at `i64::MAX`.
///
/// Configured durations may be arbitrarily large ("keep forever"), so every
/// conversion into timestamp arithmetic goes through here.
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
