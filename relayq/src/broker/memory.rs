//! In-memory broker
//!
//! Append log per topic with consumer-group cursors, mirroring stream
//! semantics: a new group starts from the first message, members of a group
//! share its cursor, and a failed delivery stays pending instead of being
//! handed out again.

use super::{Broker, MessageHandler};
use crate::shutdown::Shutdown;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Upper bound on an idle consumer's wait before it checks the log again
const IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: BTreeSet<usize>,
    acked: usize,
}

#[derive(Debug, Default)]
struct TopicLog {
    messages: Vec<Vec<u8>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
}

/// In-memory broker
///
/// Cloning shares the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        // Handlers never run under this lock.
        self.inner
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of messages ever produced to `topic`
    pub fn len(&self, topic: &str) -> usize {
        self.topics().get(topic).map_or(0, |log| log.messages.len())
    }

    /// Whether nothing was ever produced to `topic`
    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Copy of every message produced to `topic`, oldest first
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics()
            .get(topic)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Deliveries of `group` that were handed out but not acknowledged
    pub fn pending(&self, topic: &str, group: &str) -> usize {
        self.group_stat(topic, group, |g| g.pending.len())
    }

    /// Deliveries of `group` that were acknowledged
    pub fn acked(&self, topic: &str, group: &str) -> usize {
        self.group_stat(topic, group, |g| g.acked)
    }

    /// Messages `group` has not received yet
    pub fn backlog(&self, topic: &str, group: &str) -> usize {
        let topics = self.topics();
        match topics.get(topic) {
            Some(log) => {
                let cursor = log.groups.get(group).map_or(0, |g| g.cursor);
                log.messages.len().saturating_sub(cursor)
            }
            None => 0,
        }
    }

    fn group_stat(&self, topic: &str, group: &str, f: impl Fn(&GroupState) -> usize) -> usize {
        self.topics()
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map_or(0, f)
    }

    /// Hand out the next message for `group`, creating the group on first use
    fn claim(&self, topic: &str, group: &str) -> Option<(usize, Vec<u8>)> {
        let mut topics = self.topics();
        let log = topics.entry(topic.to_string()).or_default();
        let state = log.groups.entry(group.to_string()).or_default();
        let index = state.cursor;
        let message = log.messages.get(index)?.clone();
        state.cursor += 1;
        state.pending.insert(index);
        Some((index, message))
    }

    fn ack(&self, topic: &str, group: &str, index: usize) {
        let mut topics = self.topics();
        if let Some(state) = topics.get_mut(topic).and_then(|log| log.groups.get_mut(group)) {
            if state.pending.remove(&index) {
                state.acked += 1;
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn produce(&self, topic: &str, raw: &[u8]) -> Result<()> {
        self.topics()
            .entry(topic.to_string())
            .or_default()
            .messages
            .push(raw.to_vec());
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        group: &str,
        handler: &dyn MessageHandler,
        shutdown: &Shutdown,
    ) -> Result<()> {
        debug!("[memory] consuming topic: {}, group: {}", topic, group);
        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }

            // Register interest before looking so a produce in between is not missed
            let notified = self.inner.notify.notified();

            match self.claim(topic, group) {
                Some((index, message)) => match handler.handle(&message).await {
                    Ok(()) => self.ack(topic, group, index),
                    Err(e) => debug!(
                        "[memory] topic: {}, group: {}, index: {}, unacked: {}",
                        topic, group, index, e
                    ),
                },
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = shutdown.triggered() => return Ok(()),
                        _ = tokio::time::sleep(IDLE_WAIT) => {}
                    }
                }
            }
        }
    }
}
