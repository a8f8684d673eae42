//! In-memory retry store
//!
//! Same semantics as the SQL store, kept in a `BTreeMap` ordered by id.
//! Nothing survives the process.

use super::{due_at, Clock, RetryPush, RetryRecord, RetryStore, SystemClock, SCAN_PAGE_SIZE};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Records {
    next_id: i64,
    rows: BTreeMap<i64, RetryRecord>,
}

/// In-memory retry store
///
/// Clones share the same records.
#[derive(Clone)]
pub struct MemoryRetryStore {
    records: Arc<Mutex<Records>>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl Default for MemoryRetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRetryStore {
    /// Create an empty store on the wall clock
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Records::default())),
            clock: Arc::new(SystemClock),
            page_size: SCAN_PAGE_SIZE as usize,
        }
    }

    /// Use another clock
    #[must_use]
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Records fetched per scan page (at least 1)
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Total number of records, dead letters included
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    /// Whether the store holds no record
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn due_page(
        &self,
        topic: &str,
        task: &str,
        now: chrono::DateTime<chrono::Utc>,
        after_id: i64,
    ) -> Vec<(i64, Vec<u8>)> {
        self.lock()
            .rows
            .range(after_id + 1..)
            .map(|(_, record)| record)
            .filter(|r| r.topic == topic && r.task == task && !r.is_failed && r.next_at < now)
            .take(self.page_size)
            .map(|r| (r.id, r.message.clone()))
            .collect()
    }
}

impl std::fmt::Debug for MemoryRetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRetryStore")
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&self, _topic: &str, _task: &str) -> Result<()> {
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
        let mut records = self.lock();
        records.next_id += 1;
        let id = records.next_id;
        records.rows.insert(
            id,
            RetryRecord {
                id,
                topic: topic.to_string(),
                task: task.to_string(),
                message: message.to_vec(),
                error: error.to_string(),
                is_failed,
                interval_secs,
                next_at: due_at(now, interval_secs),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn run(&self, topic: &str, task: &str, push: &dyn RetryPush) -> Result<usize> {
        let now = self.clock.now();
        let mut last_id = 0;
        let mut pushed = 0;

        loop {
            let page = self.due_page(topic, task, now, last_id);
            if page.is_empty() {
                return Ok(pushed);
            }

            for (id, message) in page {
                push.push(id, &message).await?;
                self.lock().rows.remove(&id);
                last_id = id;
                pushed += 1;
            }
        }
    }

    async fn list(&self, topic: &str, task: &str) -> Result<Vec<RetryRecord>> {
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|r| r.topic == topic && r.task == task)
            .cloned()
            .collect())
    }
}
