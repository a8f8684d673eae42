//! Retry stores
//!
//! Durable backlog of failed deliveries. A record is written when a delivery
//! fails, picked up by a scan once its `next_at` has passed, produced back to
//! its topic through the caller's [`RetryPush`], and deleted. Records written
//! with `is_failed = true` are dead letters: scans never select them.
//!
//! Delivery is at-least-once. If the process dies after a push succeeded but
//! before the record was deleted, the next scan pushes it again.

pub mod memory;
pub mod sql;

pub use memory::MemoryRetryStore;
pub use sql::SqlRetryStore;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Records fetched per scan page
pub const SCAN_PAGE_SIZE: u32 = crate::config::DEFAULT_RETRY_PAGE_SIZE;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: std::time::Duration) {
        let Ok(by) = chrono::Duration::from_std(by) else {
            return;
        };
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(next) = now.checked_add_signed(by) {
            *now = next;
        }
    }

    /// Set the clock to `at`
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Stored retry record
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    /// Monotonic id
    pub id: i64,
    /// Topic the message came from
    pub topic: String,
    /// Task that failed
    pub task: String,
    /// Envelope bytes to produce again
    pub message: Vec<u8>,
    /// Error text of the failed attempt
    pub error: String,
    /// Dead letter, excluded from scans
    pub is_failed: bool,
    /// Delay used to compute `next_at`, in seconds
    pub interval_secs: u32,
    /// Earliest time the record may be pushed
    pub next_at: DateTime<Utc>,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

/// Callback producing a due record back to its topic
#[async_trait]
pub trait RetryPush: Send + Sync {
    /// Re-inject one record
    async fn push(&self, id: i64, message: &[u8]) -> Result<()>;
}

/// Retry store driver
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Driver name, used in logs
    fn name(&self) -> &'static str;

    /// Make sure the backing schema exists; safe to call repeatedly
    async fn init(&self, topic: &str, task: &str) -> Result<()>;

    /// Insert a record due `interval_secs` from now
    async fn add(
        &self,
        topic: &str,
        task: &str,
        message: &[u8],
        error: &str,
        interval_secs: u32,
        is_failed: bool,
    ) -> Result<()>;

    /// Push every due record of `(topic, task)`, oldest id first
    ///
    /// Each record is deleted once its push succeeded. The first push error
    /// stops the scan and is returned. Returns the number of records pushed.
    async fn run(&self, topic: &str, task: &str, push: &dyn RetryPush) -> Result<usize>;

    /// Every record of `(topic, task)`, dead letters included, by id
    async fn list(&self, topic: &str, task: &str) -> Result<Vec<RetryRecord>>;
}

/// Time `interval_secs` after `now`
pub(crate) fn due_at(now: DateTime<Utc>, interval_secs: u32) -> DateTime<Utc> {
    now + chrono::Duration::seconds(i64::from(interval_secs))
}
