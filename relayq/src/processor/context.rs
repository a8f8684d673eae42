//! Handler context module
//!
//! Delivery information handed to task handlers along with the decoded data.

use crate::shutdown::Shutdown;

/// Context provided to task handlers during execution
///
/// Long-running handlers should check [`TaskContext::is_shutting_down`] and
/// return early once the worker is stopping; the message is then retried.
#[derive(Debug, Clone)]
pub struct TaskContext {
    topic: String,
    task: String,
    retry_count: u32,
    shutdown: Shutdown,
}

impl TaskContext {
    /// Create a context detached from any shutdown signal
    pub fn new(topic: impl Into<String>, task: impl Into<String>, retry_count: u32) -> Self {
        Self {
            topic: topic.into(),
            task: task.into(),
            retry_count,
            shutdown: Shutdown::new(),
        }
    }

    /// Attach the worker's shutdown signal
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Topic the message was consumed from
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Task handling the message
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Retries already performed for this message (0 on first delivery)
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether the worker has been asked to stop
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_accessors() {
        let ctx = TaskContext::new("users", "welcome", 2);
        assert_eq!(ctx.topic(), "users");
        assert_eq!(ctx.task(), "welcome");
        assert_eq!(ctx.retry_count(), 2);
        assert!(!ctx.is_shutting_down());
    }

    #[test]
    fn test_shutdown_is_visible() {
        let shutdown = Shutdown::new();
        let ctx = TaskContext::new("users", "welcome", 0).with_shutdown(shutdown.clone());
        shutdown.trigger();
        assert!(ctx.is_shutting_down());
    }
}
