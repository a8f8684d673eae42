//! Process-wide settings
//!
//! Collects connection strings and loop timings in one place. Values come from
//! defaults, then environment variables, then explicit `with_*` overrides.

use crate::{Error, Result};
use std::time::Duration;

/// Environment variable holding the Redis URL
pub const ENV_REDIS_URL: &str = "REDIS_URL";
/// Environment variable holding the retry store database URL
pub const ENV_DATABASE_URL: &str = "RELAYQ_DATABASE_URL";
/// Environment variable holding a comma separated Kafka broker list
pub const ENV_KAFKA_BROKERS: &str = "KAFKA_BROKERS";
/// Environment variable holding the Redis pool size
pub const ENV_REDIS_POOL_SIZE: &str = "RELAYQ_REDIS_POOL_SIZE";
/// Environment variable holding the stream block timeout in milliseconds
pub const ENV_BLOCK_TIMEOUT_MS: &str = "RELAYQ_BLOCK_TIMEOUT_MS";
/// Environment variable holding the list queue poll interval in milliseconds
pub const ENV_POLL_INTERVAL_MS: &str = "RELAYQ_POLL_INTERVAL_MS";

/// Default retry interval applied when a task registers with interval 0
pub const DEFAULT_RETRY_INTERVAL_SECS: u32 = 15;

/// Default retry scan page size
pub const DEFAULT_RETRY_PAGE_SIZE: u32 = 100;

/// relayq settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Redis connection URL
    pub redis_url: String,

    /// Redis connection pool size
    pub redis_pool_size: usize,

    /// Retry store database URL
    pub database_url: String,

    /// Kafka bootstrap servers, if any
    pub kafka_brokers: Option<String>,

    /// Stream read block timeout (milliseconds)
    pub block_timeout_ms: u64,

    /// List queue poll interval when the list is empty (milliseconds)
    pub poll_interval_ms: u64,

    /// Pause between two `run` attempts of the same worker (seconds)
    pub run_pause_secs: u64,

    /// Pause between two retry scans (seconds)
    pub retry_scan_secs: u64,

    /// Retry interval used when a task does not set one (seconds)
    pub retry_interval_secs: u32,

    /// Retry scan page size
    pub retry_page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            redis_pool_size: 10,
            database_url: "sqlite://relayq.db?mode=rwc".to_string(),
            kafka_brokers: None,
            block_timeout_ms: 2000,
            poll_interval_ms: 100,
            run_pause_secs: 1,
            retry_scan_secs: 1,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            retry_page_size: DEFAULT_RETRY_PAGE_SIZE,
        }
    }
}

impl Settings {
    /// Create settings with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup
    ///
    /// Unset keys keep their defaults. Malformed numbers, and a zero block
    /// timeout or poll interval, are configuration errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(url) = lookup(ENV_REDIS_URL) {
            settings.redis_url = url;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            settings.database_url = url;
        }
        if let Some(brokers) = lookup(ENV_KAFKA_BROKERS) {
            if !brokers.trim().is_empty() {
                settings.kafka_brokers = Some(brokers);
            }
        }
        if let Some(size) = lookup(ENV_REDIS_POOL_SIZE) {
            settings.redis_pool_size = parse_number(ENV_REDIS_POOL_SIZE, &size)?;
        }
        if let Some(ms) = lookup(ENV_BLOCK_TIMEOUT_MS) {
            settings.block_timeout_ms = parse_positive(ENV_BLOCK_TIMEOUT_MS, &ms)?;
        }
        if let Some(ms) = lookup(ENV_POLL_INTERVAL_MS) {
            settings.poll_interval_ms = parse_positive(ENV_POLL_INTERVAL_MS, &ms)?;
        }

        Ok(settings)
    }

    /// Set the Redis URL
    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Set the Redis connection pool size
    #[must_use]
    pub fn with_redis_pool_size(mut self, size: usize) -> Self {
        self.redis_pool_size = size;
        self
    }

    /// Set the retry store database URL
    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Set the Kafka bootstrap servers
    #[must_use]
    pub fn with_kafka_brokers(mut self, brokers: impl Into<String>) -> Self {
        self.kafka_brokers = Some(brokers.into());
        self
    }

    /// Set the stream read block timeout
    ///
    /// The stream driver raises 0 to 1ms.
    #[must_use]
    pub fn with_block_timeout_ms(mut self, ms: u64) -> Self {
        self.block_timeout_ms = ms;
        self
    }

    /// Set the list queue poll interval
    ///
    /// The list driver raises 0 to 1ms.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the pause between worker run attempts
    #[must_use]
    pub fn with_run_pause_secs(mut self, secs: u64) -> Self {
        self.run_pause_secs = secs;
        self
    }

    /// Set the pause between retry scans
    ///
    /// The retry scheduler raises 0 to 1ms.
    #[must_use]
    pub fn with_retry_scan_secs(mut self, secs: u64) -> Self {
        self.retry_scan_secs = secs;
        self
    }

    /// Stream read block timeout as a duration
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// List queue poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Worker pause as a duration
    pub fn run_pause(&self) -> Duration {
        Duration::from_secs(self.run_pause_secs)
    }

    /// Retry scan pause as a duration
    pub fn retry_scan(&self) -> Duration {
        Duration::from_secs(self.retry_scan_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", key, value)))
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    match parse_number(key, value)? {
        0 => Err(Error::Config(format!("{} must be greater than 0", key))),
        n => Ok(n),
    }
}
