//! Task type definitions
//!
//! The envelope carried through brokers, per-task options and the payload
//! handed to the task middleware chain.

use crate::config::DEFAULT_RETRY_INTERVAL_SECS;
use crate::processor::{TaskContext, TaskHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wire envelope
///
/// `task` empty means unaddressed: every task consuming the topic handles it.
/// `retry_count` is the number of retries already granted to this message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Task the message is addressed to
    #[serde(default)]
    pub task: String,
    /// Serializer-encoded payload
    pub data: T,
    /// Completed retries
    #[serde(default)]
    pub retry_count: u32,
}

impl<T> Envelope<T> {
    /// Unaddressed envelope for a fresh message
    pub fn new(data: T) -> Self {
        Self {
            task: String::new(),
            data,
            retry_count: 0,
        }
    }

    /// Envelope addressed to `task`
    pub fn addressed(task: impl Into<String>, data: T) -> Self {
        Self {
            task: task.into(),
            data,
            retry_count: 0,
        }
    }

    /// Whether a consumer running `task` should process this envelope
    pub fn is_for(&self, task: &str) -> bool {
        self.task.is_empty() || self.task == task
    }
}

/// Outcome of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    /// Retry count to store with the record
    pub retry_count: u32,
    /// Whether the record is a dead letter
    pub is_failed: bool,
}

/// Task options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Maximum number of retries (0 = unlimited)
    pub max_retry: u32,
    /// Fixed delay before each retry, in seconds (0 = default of 15)
    pub retry_interval_secs: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: 0,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

impl TaskOptions {
    /// Options with a retry limit and interval
    pub fn new(max_retry: u32, retry_interval_secs: u32) -> Self {
        Self {
            max_retry,
            retry_interval_secs,
        }
        .normalized()
    }

    /// Replace a zero interval by the default
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.retry_interval_secs == 0 {
            self.retry_interval_secs = DEFAULT_RETRY_INTERVAL_SECS;
        }
        self
    }

    /// Account for one more failed attempt of a message that already had
    /// `retry_count` retries
    ///
    /// The count is bumped first. When that exceeds `max_retry` the record
    /// becomes a dead letter and the bump is undone, so a dead letter carries
    /// the number of retries actually performed.
    pub fn escalate(&self, retry_count: u32) -> Escalation {
        let bumped = retry_count.saturating_add(1);
        let is_failed = self.max_retry > 0 && bumped > self.max_retry;
        Escalation {
            retry_count: if is_failed { bumped - 1 } else { bumped },
            is_failed,
        }
    }
}

/// Registered task
pub struct TaskDefinition<D> {
    /// Task name
    pub name: String,
    /// Options
    pub options: TaskOptions,
    pub(crate) handler: Arc<dyn TaskHandler<D>>,
}

impl<D> TaskDefinition<D> {
    /// Create a task definition
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler<D>>,
        options: TaskOptions,
    ) -> Self {
        Self {
            name: name.into(),
            options: options.normalized(),
            handler,
        }
    }
}

impl<D> Clone for TaskDefinition<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            options: self.options,
            handler: self.handler.clone(),
        }
    }
}

impl<D> std::fmt::Debug for TaskDefinition<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// Payload flowing through a queue's task chain
#[derive(Debug, Clone)]
pub struct TaskPayload<D> {
    /// Delivery context
    pub context: TaskContext,
    /// Decoded task data
    pub data: D,
}
