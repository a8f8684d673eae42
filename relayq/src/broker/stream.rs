//! Redis stream broker
//!
//! Messages are stream entries with a single `message` field. Each consumer
//! group is created lazily from the start of the stream the first time a
//! consumer needs it.

use super::{Broker, MessageHandler, TRANSPORT_BACKOFF};
use crate::config::Settings;
use crate::shutdown::Shutdown;
use crate::storage::{Keys, RedisClient, StreamTrim};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Stream driver configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Longest time a single group read may block (at least 1ms)
    pub block_timeout: Duration,
    /// Entries fetched per read
    pub batch_size: u64,
    /// Consumer name inside the group (random when not set)
    pub consumer_name: Option<String>,
    /// Poll until the stream has an entry before joining the group
    pub wait_first_message: bool,
    /// Trimming applied when producing
    pub trim: Option<StreamTrim>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_millis(2000),
            batch_size: 10,
            consumer_name: None,
            wait_first_message: false,
            trim: None,
        }
    }
}

impl From<&Settings> for StreamConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            block_timeout: settings.block_timeout(),
            ..Self::default()
        }
    }
}

impl StreamConfig {
    /// Block timeout passed to `XREADGROUP`
    ///
    /// Never 0, which Redis reads as "block forever".
    pub fn block_millis(&self) -> u64 {
        u64::try_from(self.block_timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }

    /// Use a fixed consumer name
    #[must_use]
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    /// Wait for the first entry before creating the group
    #[must_use]
    pub fn with_wait_first_message(mut self, wait: bool) -> Self {
        self.wait_first_message = wait;
        self
    }

    /// Keep roughly `len` entries per stream
    #[must_use]
    pub fn with_max_len(mut self, len: u64) -> Self {
        self.trim = Some(StreamTrim::MaxLen(len));
        self
    }

    /// Drop entries older than `ttl`
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.trim = Some(StreamTrim::Ttl(ttl));
        self
    }
}

/// Redis stream broker
#[derive(Debug, Clone)]
pub struct RedisStreamBroker {
    client: RedisClient,
    config: StreamConfig,
}

impl RedisStreamBroker {
    /// Create a stream broker over a shared client
    pub fn new(client: RedisClient) -> Self {
        Self::with_config(client, StreamConfig::default())
    }

    /// Create a stream broker with explicit settings
    pub fn with_config(client: RedisClient, config: StreamConfig) -> Self {
        Self { client, config }
    }

    /// Make sure `group` exists on `key`
    async fn ensure_group(&self, key: &str, group: &str) -> Result<()> {
        let groups = self.client.xgroup_names(key).await?;
        if groups.iter().any(|name| name == group) {
            return Ok(());
        }
        if self.client.xgroup_create(key, group).await? {
            debug!("[redis.stream] created group: {}, stream: {}", group, key);
        }
        Ok(())
    }

    /// Poll until the stream holds an entry
    ///
    /// Returns false when shutdown interrupted the wait.
    async fn wait_first_message(&self, key: &str, shutdown: &Shutdown) -> Result<bool> {
        loop {
            if self.client.xlen(key).await? > 0 {
                return Ok(true);
            }
            if shutdown.sleep(Duration::from_secs(1)).await {
                return Ok(false);
            }
        }
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    fn name(&self) -> &'static str {
        "redis-stream"
    }

    async fn produce(&self, topic: &str, raw: &[u8]) -> Result<()> {
        self.client
            .xadd(&Keys::stream(topic), raw, self.config.trim)
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        group: &str,
        handler: &dyn MessageHandler,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let key = Keys::stream(topic);
        let consumer = self
            .config
            .consumer_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let block_ms = self.config.block_millis();

        if self.config.wait_first_message && !self.wait_first_message(&key, shutdown).await? {
            return Ok(());
        }
        self.ensure_group(&key, group).await?;

        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }

            let read = tokio::select! {
                read = self.client.xreadgroup(
                    &key,
                    group,
                    &consumer,
                    self.config.batch_size,
                    block_ms,
                ) => read,
                _ = shutdown.triggered() => return Ok(()),
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) if e.is_retryable() => {
                    warn!("[redis.xRead] topic: {}, group: {}, error: {}", topic, group, e);
                    if shutdown.sleep(TRANSPORT_BACKOFF).await {
                        return Ok(());
                    }
                    // The stream or group may have been deleted under us
                    if let Err(e) = self.ensure_group(&key, group).await {
                        warn!("[redis.group] topic: {}, group: {}, error: {}", topic, group, e);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            for entry in entries {
                let Some(message) = entry.message else {
                    continue;
                };
                if handler.handle(&message).await.is_err() {
                    continue;
                }
                if let Err(e) = self.client.xack(&key, group, &entry.id).await {
                    warn!(
                        "[redis.xAck] topic: {}, group: {}, messageId: {}, error: {}",
                        topic, group, entry.id, e
                    );
                }
            }
        }
    }
}
