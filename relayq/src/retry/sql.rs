//! SQL retry store
//!
//! Records live in the `queue_retry` table of a SQLite database. Times are
//! stored as epoch milliseconds. Scans page by id (`id > last`), so records
//! deleted during a scan never shift the next page.

use super::{due_at, Clock, RetryPush, RetryRecord, RetryStore, SystemClock, SCAN_PAGE_SIZE};
use crate::config::Settings;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::sync::Arc;
use tracing::debug;

const TABLE: &str = "queue_retry";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_retry (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    topic       TEXT    NOT NULL,
    task        TEXT    NOT NULL,
    is_failed   INTEGER NOT NULL DEFAULT 0,
    interval    INTEGER NOT NULL,
    message     BLOB    NOT NULL,
    error       TEXT    NOT NULL,
    next_at     INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
)
"#;

const CREATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_retry_scan
    ON queue_retry (topic, task, is_failed, next_at)
"#;

/// SQLite-backed retry store
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct SqlRetryStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    page_size: u32,
}

impl SqlRetryStore {
    /// Wrap an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            page_size: SCAN_PAGE_SIZE,
        }
    }

    /// Open a pool on `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        debug!("Retry store connected: {}", url);
        Ok(Self::new(pool))
    }

    /// Open the database named by the settings and apply their page size
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::connect(&settings.database_url)
            .await?
            .with_page_size(settings.retry_page_size))
    }

    /// Use another clock
    #[must_use]
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Records fetched per scan page (at least 1)
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn table_exists(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(TABLE)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// One page of due ids and messages after `after_id`
    async fn due_page(
        &self,
        topic: &str,
        task: &str,
        now_ms: i64,
        after_id: i64,
    ) -> Result<Vec<(i64, Vec<u8>)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, message
            FROM queue_retry
            WHERE topic = ?1 AND task = ?2 AND is_failed = 0 AND next_at < ?3 AND id > ?4
            ORDER BY id ASC
            LIMIT ?5
            "#,
        )
        .bind(topic)
        .bind(task)
        .bind(now_ms)
        .bind(after_id)
        .bind(i64::from(self.page_size))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("message")?)))
            .collect()
    }
}

impl std::fmt::Debug for SqlRetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlRetryStore")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn record_from_row(row: &SqliteRow) -> Result<RetryRecord> {
    Ok(RetryRecord {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        task: row.try_get("task")?,
        message: row.try_get("message")?,
        error: row.try_get("error")?,
        is_failed: row.try_get("is_failed")?,
        interval_secs: row.try_get("interval")?,
        next_at: from_millis(row.try_get("next_at")?),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

#[async_trait]
impl RetryStore for SqlRetryStore {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn init(&self, _topic: &str, _task: &str) -> Result<()> {
        if self.table_exists().await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
        sqlx::query(CREATE_INDEX).execute(&mut *tx).await?;
        tx.commit().await?;
        debug!("Created retry table {}", TABLE);
        Ok(())
    }

    async fn add(
        &self,
        topic: &str,
        task: &str,
        message: &[u8],
        error: &str,
        interval_secs: u32,
        is_failed: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        sqlx::query(
            r#"
            INSERT INTO queue_retry
                (topic, task, is_failed, interval, message, error, next_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(topic)
        .bind(task)
        .bind(is_failed)
        .bind(interval_secs)
        .bind(message)
        .bind(error)
        .bind(due_at(now, interval_secs).timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run(&self, topic: &str, task: &str, push: &dyn RetryPush) -> Result<usize> {
        let now_ms = self.clock.now().timestamp_millis();
        let mut last_id = 0;
        let mut pushed = 0;

        loop {
            let page = self.due_page(topic, task, now_ms, last_id).await?;
            if page.is_empty() {
                return Ok(pushed);
            }

            for (id, message) in page {
                push.push(id, &message).await?;
                sqlx::query("DELETE FROM queue_retry WHERE id = ?1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                last_id = id;
                pushed += 1;
            }
        }
    }

    async fn list(&self, topic: &str, task: &str) -> Result<Vec<RetryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, task, is_failed, interval, message, error, next_at, created_at
            FROM queue_retry
            WHERE topic = ?1 AND task = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(topic)
        .bind(task)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ManualClock;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let store = SqlRetryStore::new(memory_pool().await);
        assert!(!store.table_exists().await.unwrap());
        store.init("users", "welcome").await.unwrap();
        store.init("users", "welcome").await.unwrap();
        assert!(store.table_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_add_stores_schedule() {
        let clock = ManualClock::default();
        let store = SqlRetryStore::new(memory_pool().await).with_clock(clock.clone());
        store.init("users", "welcome").await.unwrap();

        store
            .add("users", "welcome", b"{}", "smtp down", 10, false)
            .await
            .unwrap();

        let records = store.list("users", "welcome").await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.error, "smtp down");
        assert_eq!(record.interval_secs, 10);
        assert!(!record.is_failed);
        assert_eq!(
            record.next_at.timestamp_millis() - record.created_at.timestamp_millis(),
            10_000
        );
        assert_eq!(record.created_at.timestamp_millis(), clock.now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_topic_and_task() {
        let store = SqlRetryStore::new(memory_pool().await);
        store.init("users", "welcome").await.unwrap();
        store.add("users", "welcome", b"a", "e", 1, false).await.unwrap();
        store.add("users", "digest", b"b", "e", 1, false).await.unwrap();
        store.add("orders", "welcome", b"c", "e", 1, true).await.unwrap();

        let records = store.list("users", "welcome").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, b"a");
    }

    #[tokio::test]
    async fn test_page_size_floor() {
        let store = SqlRetryStore::new(memory_pool().await).with_page_size(0);
        assert_eq!(store.page_size, 1);
    }
}
