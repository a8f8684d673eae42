//! Common test utilities
//!
//! Shared payloads, handlers and helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use relayq::processor::{TaskContext, TaskHandler};
use relayq::retry::RetryPush;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Payload used across tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mail {
    pub email: String,
}

impl Mail {
    pub fn to(email: &str) -> Self {
        Self {
            email: email.to_string(),
        }
    }
}

/// Handler failing its first `failures` calls, then succeeding
///
/// Records the retry count seen at each call.
#[derive(Clone, Default)]
pub struct FlakyHandler {
    failures: u32,
    pub calls: Arc<AtomicU32>,
    pub seen: Arc<Mutex<Vec<(String, u32)>>>,
}

impl FlakyHandler {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, u32)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler<Mail> for FlakyHandler {
    async fn handle(&self, ctx: &TaskContext, mail: &Mail) -> relayq::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((mail.email.clone(), ctx.retry_count()));
        if call < self.failures {
            return Err(relayq::Error::handler(format!("attempt {} failed", call + 1)));
        }
        Ok(())
    }
}

/// Push callback recording ids in call order
#[derive(Default)]
pub struct RecordingPush {
    pub ids: Mutex<Vec<i64>>,
    fail_at: Option<i64>,
}

impl RecordingPush {
    pub fn failing_at(id: i64) -> Self {
        Self {
            ids: Mutex::new(Vec::new()),
            fail_at: Some(id),
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        self.ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetryPush for RecordingPush {
    async fn push(&self, id: i64, _message: &[u8]) -> relayq::Result<()> {
        if self.fail_at == Some(id) {
            return Err(relayq::Error::Connection("broker down".into()));
        }
        self.ids.lock().unwrap().push(id);
        Ok(())
    }
}

/// Wait for a condition to be true
///
/// Returns Err if the condition is still false after `timeout`.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let check_interval = Duration::from_millis(10);

    while start.elapsed() < timeout {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(check_interval).await;
    }

    Err(format!("Condition not met after {:?}", timeout))
}

/// In-memory SQLite pool kept on a single connection for the whole test
pub async fn memory_pool() -> sqlx::SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database")
}

/// Redis URL for ignored integration tests
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}
