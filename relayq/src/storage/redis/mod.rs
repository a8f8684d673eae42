//! Redis client wrapper
//!
//! Typed stream and list operations over a shared `fred` pool. Both Redis
//! broker drivers go through this type.

use crate::config::Settings;
use crate::{Error, Result};
use chrono::Utc;
use fred::{
    interfaces::*,
    prelude::*,
    types::{RedisConfig as FredRedisConfig, ReconnectPolicy, XReadResponse},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Stream entry field holding the message bytes
pub const MESSAGE_FIELD: &str = "message";

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

impl From<&Settings> for RedisConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            url: settings.redis_url.clone(),
            pool_size: settings.redis_pool_size,
        }
    }
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Entry id
    pub id: String,
    /// Content of the `message` field
    pub message: Option<Vec<u8>>,
}

/// Approximate trimming applied on every append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTrim {
    /// Keep about this many entries
    MaxLen(u64),
    /// Drop entries older than this
    Ttl(Duration),
}

/// Redis client
#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<RedisPool>,
}

impl RedisClient {
    /// Create a new Redis client
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let redis_config = FredRedisConfig::from_url(&config.url)?;
        let pool = RedisPool::new(
            redis_config,
            None,
            None,
            Some(ReconnectPolicy::default()),
            config.pool_size,
        )?;

        pool.init()
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", config.url, e)))?;
        tracing::debug!("Redis pool ready: {} ({} connections)", config.url, config.pool_size);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create client from connection URL
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig {
            url: url.into(),
            ..RedisConfig::default()
        })
        .await
    }

    /// Get the underlying Redis connection pool
    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }

    /// Ping Redis
    pub async fn ping(&self) -> Result<String> {
        let result: String = self.pool.ping().await?;
        Ok(result)
    }

    /// Check if Key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let result: bool = self.pool.exists(key).await?;
        Ok(result)
    }

    /// Delete Key
    pub async fn del(&self, key: &str) -> Result<usize> {
        let result: usize = self.pool.del(key).await?;
        Ok(result)
    }

    /// Stream operation: append an entry with a single `message` field
    pub async fn xadd(
        &self,
        key: &str,
        message: &[u8],
        trim: Option<StreamTrim>,
    ) -> Result<String> {
        let fields = vec![(MESSAGE_FIELD, RedisValue::from(message.to_vec()))];
        let id: String = match trim {
            None => self.pool.xadd(key, false, None, "*", fields).await?,
            Some(StreamTrim::MaxLen(len)) => {
                let len = i64::try_from(len).unwrap_or(i64::MAX);
                self.pool
                    .xadd(key, false, ("MAXLEN", "~", len), "*", fields)
                    .await?
            }
            Some(StreamTrim::Ttl(ttl)) => {
                let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
                let cutoff = Utc::now().timestamp_millis().saturating_sub(ttl_ms).max(0);
                let min_id = format!("{}-0", cutoff);
                self.pool
                    .xadd(key, false, ("MINID", "~", min_id), "*", fields)
                    .await?
            }
        };
        Ok(id)
    }

    /// Stream operation: number of entries
    pub async fn xlen(&self, key: &str) -> Result<u64> {
        let result: u64 = self.pool.xlen(key).await?;
        Ok(result)
    }

    /// Stream operation: names of the consumer groups on a stream
    ///
    /// A missing stream has no groups.
    pub async fn xgroup_names(&self, key: &str) -> Result<Vec<String>> {
        if !self.exists(key).await? {
            return Ok(Vec::new());
        }
        let groups: Vec<HashMap<String, RedisValue>> = self.pool.xinfo_groups(key).await?;
        Ok(groups
            .into_iter()
            .filter_map(|group| group.get("name").and_then(|v| v.as_string()))
            .collect())
    }

    /// Stream operation: create a consumer group reading from the start,
    /// creating the stream if needed
    ///
    /// Returns false when the group already existed.
    pub async fn xgroup_create(&self, key: &str, group: &str) -> Result<bool> {
        let result: std::result::Result<(), RedisError> =
            self.pool.xgroup_create(key, group, "0", true).await;
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.details().starts_with("BUSYGROUP") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream operation: read new entries for a group member
    ///
    /// Blocks at most `block_ms`; a timeout yields an empty vector.
    pub async fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: u64,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let response: XReadResponse<String, String, String, RedisValue> = self
            .pool
            .xreadgroup_map(group, consumer, Some(count), Some(block_ms), false, key, ">")
            .await?;

        let mut entries = Vec::new();
        for (_stream, records) in response {
            for (id, fields) in records {
                let message = fields
                    .get(MESSAGE_FIELD)
                    .and_then(|v| v.as_bytes())
                    .map(<[u8]>::to_vec);
                entries.push(StreamEntry { id, message });
            }
        }
        Ok(entries)
    }

    /// Stream operation: acknowledge an entry
    pub async fn xack(&self, key: &str, group: &str, id: &str) -> Result<u64> {
        let result: u64 = self.pool.xack(key, group, id).await?;
        Ok(result)
    }

    /// List operation: right push
    pub async fn rpush(&self, key: &str, value: &[u8]) -> Result<u64> {
        let result: u64 = self.pool.rpush(key, RedisValue::from(value.to_vec())).await?;
        Ok(result)
    }

    /// List operation: left pop, `None` when the list is empty
    pub async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result: Option<RedisValue> = self.pool.lpop(key, None).await?;
        Ok(result.and_then(|v| v.as_bytes().map(<[u8]>::to_vec)))
    }

    /// List operation: get length
    pub async fn llen(&self, key: &str) -> Result<u64> {
        let result: u64 = self.pool.llen(key).await?;
        Ok(result)
    }
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Keys;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings::default()
            .with_redis_url("redis://cache:6380")
            .with_redis_pool_size(4);
        let config = RedisConfig::from(&settings);
        assert_eq!(config.url, "redis://cache:6380");
        assert_eq!(config.pool_size, 4);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_redis_ping() {
        let client = RedisClient::from_url(redis_url()).await.unwrap();
        let result = client.ping().await.unwrap();
        assert_eq!(result, "PONG");
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_stream_group_lifecycle() {
        let client = RedisClient::from_url(redis_url()).await.unwrap();
        let key = Keys::stream(&format!("test-{}", uuid::Uuid::new_v4()));

        assert!(client.xgroup_names(&key).await.unwrap().is_empty());
        assert!(client.xgroup_create(&key, "welcome").await.unwrap());
        assert!(!client.xgroup_create(&key, "welcome").await.unwrap());
        assert_eq!(client.xgroup_names(&key).await.unwrap(), vec!["welcome"]);

        client.xadd(&key, b"hello", None).await.unwrap();
        let entries = client.xreadgroup(&key, "welcome", "c1", 10, 100).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.as_deref(), Some(&b"hello"[..]));
        assert_eq!(client.xack(&key, "welcome", &entries[0].id).await.unwrap(), 1);

        client.del(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_xadd_max_len_trims() {
        let client = RedisClient::from_url(redis_url()).await.unwrap();
        let key = Keys::stream(&format!("test-{}", uuid::Uuid::new_v4()));

        for _ in 0..500 {
            client
                .xadd(&key, b"x", Some(StreamTrim::MaxLen(10)))
                .await
                .unwrap();
        }
        // Approximate trimming works on whole macro nodes
        assert!(client.xlen(&key).await.unwrap() < 500);
        client.del(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_list_push_pop() {
        let client = RedisClient::from_url(redis_url()).await.unwrap();
        let key = Keys::list(&format!("test-{}", uuid::Uuid::new_v4()));

        client.rpush(&key, b"a").await.unwrap();
        client.rpush(&key, b"b").await.unwrap();
        assert_eq!(client.lpop(&key).await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(client.lpop(&key).await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(client.lpop(&key).await.unwrap(), None);
    }
}
