//! Pipeline configuration loading and representation.
//!
//! Values only, no behavior. Defaults match production; every value can be overridden
//! through a `CITYSCORE_*` environment variable. Durations are given in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::DispatcherConfig;
use crate::log_batcher::LogBatcherConfig;

pub const ENV_DEBOUNCE_WINDOW_MS: &str = "CITYSCORE_DEBOUNCE_WINDOW_MS";
pub const ENV_LOG_BATCH_SIZE: &str = "CITYSCORE_LOG_BATCH_SIZE";
pub const ENV_LOG_BATCH_TIMEOUT_MS: &str = "CITYSCORE_LOG_BATCH_TIMEOUT_MS";
pub const ENV_LOG_CHANNEL_CAPACITY: &str = "CITYSCORE_LOG_CHANNEL_CAPACITY";
pub const ENV_PERSIST_TIMEOUT_MS: &str = "CITYSCORE_PERSIST_TIMEOUT_MS";
pub const ENV_FLUSH_BACKOFF_MS: &str = "CITYSCORE_FLUSH_BACKOFF_MS";
pub const ENV_SHUTDOWN_GRACE_MS: &str = "CITYSCORE_SHUTDOWN_GRACE_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}: {reason}")]
    Parse {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

/// Tunables of the dispatch and log-ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Quiet period before a coalescible task runs.
    pub debounce_window: Duration,
    /// Flush a log batch once it holds this many entries.
    pub log_batch_size: usize,
    /// Flush a non-empty log batch after this long, even if not full.
    pub log_batch_timeout: Duration,
    /// Bound of the drop-oldest log channel.
    pub log_channel_capacity: usize,
    /// Upper bound for a single persistence call or handler execution.
    pub persist_timeout: Duration,
    /// Pause after a failed log flush.
    pub flush_failure_backoff: Duration,
    /// Time allowed to drain buffered logs on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(120),
            log_batch_size: 50,
            log_batch_timeout: Duration::from_secs(5),
            log_channel_capacity: 10_000,
            persist_timeout: Duration::from_secs(10),
            flush_failure_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            debounce_window: read_millis(&lookup, ENV_DEBOUNCE_WINDOW_MS)?
                .unwrap_or(defaults.debounce_window),
            log_batch_size: read_usize(&lookup, ENV_LOG_BATCH_SIZE)?
                .unwrap_or(defaults.log_batch_size),
            log_batch_timeout: read_millis(&lookup, ENV_LOG_BATCH_TIMEOUT_MS)?
                .unwrap_or(defaults.log_batch_timeout),
            log_channel_capacity: read_usize(&lookup, ENV_LOG_CHANNEL_CAPACITY)?
                .unwrap_or(defaults.log_channel_capacity),
            persist_timeout: read_millis(&lookup, ENV_PERSIST_TIMEOUT_MS)?
                .unwrap_or(defaults.persist_timeout),
            flush_failure_backoff: read_millis(&lookup, ENV_FLUSH_BACKOFF_MS)?
                .unwrap_or(defaults.flush_failure_backoff),
            shutdown_grace: read_millis(&lookup, ENV_SHUTDOWN_GRACE_MS)?
                .unwrap_or(defaults.shutdown_grace),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the workers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_batch_size == 0 {
            return Err(out_of_range(ENV_LOG_BATCH_SIZE, "must be at least 1"));
        }
        if self.log_channel_capacity == 0 {
            return Err(out_of_range(ENV_LOG_CHANNEL_CAPACITY, "must be at least 1"));
        }
        if self.log_batch_timeout.is_zero() {
            return Err(out_of_range(ENV_LOG_BATCH_TIMEOUT_MS, "must be positive"));
        }
        if self.persist_timeout.is_zero() {
            return Err(out_of_range(ENV_PERSIST_TIMEOUT_MS, "must be positive"));
        }
        Ok(())
    }

    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn with_log_batch(mut self, size: usize, timeout: Duration) -> Self {
        self.log_batch_size = size;
        self.log_batch_timeout = timeout;
        self
    }

    pub fn with_log_channel_capacity(mut self, capacity: usize) -> Self {
        self.log_channel_capacity = capacity;
        self
    }

    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    pub fn with_flush_failure_backoff(mut self, backoff: Duration) -> Self {
        self.flush_failure_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Settings for the task dispatcher worker.
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            debounce_window: self.debounce_window,
            handler_timeout: self.persist_timeout,
            ..DispatcherConfig::default()
        }
    }

    /// Settings for the log batcher worker.
    pub fn log_batcher(&self) -> LogBatcherConfig {
        LogBatcherConfig {
            batch_size: self.log_batch_size,
            batch_timeout: self.log_batch_timeout,
            persist_timeout: self.persist_timeout,
            failure_backoff: self.flush_failure_backoff,
            shutdown_grace: self.shutdown_grace,
            ..LogBatcherConfig::default()
        }
    }
}

fn out_of_range(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        reason: reason.to_string(),
    }
}

fn read_usize<F>(lookup: &F, key: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn read_millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::Parse {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
