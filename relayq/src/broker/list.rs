//! Redis list broker
//!
//! `RPUSH` to produce, `LPOP` to consume. There are no consumer groups: every
//! consumer of a topic competes for the same list, and the pop is the
//! delivery commitment. A message whose handler fails is gone from the list
//! and only survives through the retry store.

use super::{Broker, MessageHandler, TRANSPORT_BACKOFF};
use crate::config::Settings;
use crate::shutdown::Shutdown;
use crate::storage::{Keys, RedisClient};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// List driver configuration
#[derive(Debug, Clone)]
pub struct ListConfig {
    /// Sleep after an empty pop (at least 1ms)
    pub poll_interval: Duration,
}

/// Shortest sleep after an empty pop
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl ListConfig {
    /// Sleep actually taken after an empty pop
    pub fn idle_pause(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&Settings> for ListConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
        }
    }
}

/// Redis list broker
#[derive(Debug, Clone)]
pub struct RedisListBroker {
    client: RedisClient,
    config: ListConfig,
}

impl RedisListBroker {
    /// Create a list broker over a shared client
    pub fn new(client: RedisClient) -> Self {
        Self::with_config(client, ListConfig::default())
    }

    /// Create a list broker with explicit settings
    pub fn with_config(client: RedisClient, config: ListConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Broker for RedisListBroker {
    fn name(&self) -> &'static str {
        "redis-list"
    }

    async fn produce(&self, topic: &str, raw: &[u8]) -> Result<()> {
        self.client.rpush(&Keys::list(topic), raw).await?;
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        _group: &str,
        handler: &dyn MessageHandler,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let key = Keys::list(topic);
        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }

            match self.client.lpop(&key).await {
                Ok(Some(message)) => {
                    if let Err(e) = handler.handle(&message).await {
                        debug!("[redis.lPop] topic: {}, handler error: {}", topic, e);
                    }
                }
                Ok(None) => {
                    if shutdown.sleep(self.config.idle_pause()).await {
                        return Ok(());
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!("[redis.lPop] topic: {}, error: {}", topic, e);
                    if shutdown.sleep(TRANSPORT_BACKOFF).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
