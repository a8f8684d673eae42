//! Prometheus metrics collector for relayq
//!
//! Counts produced messages, handled deliveries, failures and retry-store
//! traffic per queue and task.

use crate::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Failure class recorded on `relayq_tasks_failed_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Envelope or payload could not be decoded
    Decode,
    /// Task handler (or its middleware) returned an error
    Handler,
}

impl FailureKind {
    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Decode => "decode",
            FailureKind::Handler => "handler",
        }
    }
}

/// Queue metrics collector
///
/// Owns its registry so several collectors can coexist in one process.
#[derive(Clone)]
pub struct QueueMetrics {
    registry: Arc<Registry>,

    messages_produced_total: IntCounterVec,
    tasks_processed_total: IntCounterVec,
    tasks_failed_total: IntCounterVec,

    retries_scheduled_total: IntCounterVec,
    tasks_escalated_total: IntCounterVec,
    retries_redelivered_total: IntCounterVec,

    task_duration_seconds: HistogramVec,
}

impl QueueMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_produced_total = IntCounterVec::new(
            Opts::new("relayq_messages_produced_total", "Total number of messages produced"),
            &["queue"],
        )?;

        let tasks_processed_total = IntCounterVec::new(
            Opts::new(
                "relayq_tasks_processed_total",
                "Total number of deliveries handled successfully",
            ),
            &["queue", "task"],
        )?;

        let tasks_failed_total = IntCounterVec::new(
            Opts::new("relayq_tasks_failed_total", "Total number of failed deliveries"),
            &["queue", "task", "kind"],
        )?;

        let retries_scheduled_total = IntCounterVec::new(
            Opts::new("relayq_retries_scheduled_total", "Total number of retry records written"),
            &["queue", "task"],
        )?;

        let tasks_escalated_total = IntCounterVec::new(
            Opts::new("relayq_tasks_escalated_total", "Total number of records marked as failed"),
            &["queue", "task"],
        )?;

        let retries_redelivered_total = IntCounterVec::new(
            Opts::new(
                "relayq_retries_redelivered_total",
                "Total number of retry records produced again",
            ),
            &["queue", "task"],
        )?;

        let task_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relayq_task_duration_seconds",
                "Task processing duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["queue", "task"],
        )?;

        registry.register(Box::new(messages_produced_total.clone()))?;
        registry.register(Box::new(tasks_processed_total.clone()))?;
        registry.register(Box::new(tasks_failed_total.clone()))?;
        registry.register(Box::new(retries_scheduled_total.clone()))?;
        registry.register(Box::new(tasks_escalated_total.clone()))?;
        registry.register(Box::new(retries_redelivered_total.clone()))?;
        registry.register(Box::new(task_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            messages_produced_total,
            tasks_processed_total,
            tasks_failed_total,
            retries_scheduled_total,
            tasks_escalated_total,
            retries_redelivered_total,
            task_duration_seconds,
        })
    }

    /// Record a produced message
    pub fn record_produced(&self, queue: &str) {
        self.messages_produced_total.with_label_values(&[queue]).inc();
    }

    /// Record a delivery handled successfully
    pub fn record_processed(&self, queue: &str, task: &str) {
        self.tasks_processed_total
            .with_label_values(&[queue, task])
            .inc();
    }

    /// Record a failed delivery
    pub fn record_failed(&self, queue: &str, task: &str, kind: FailureKind) {
        self.tasks_failed_total
            .with_label_values(&[queue, task, kind.as_str()])
            .inc();
    }

    /// Record a retry record written; `escalated` when it is a dead letter
    pub fn record_retry_added(&self, queue: &str, task: &str, escalated: bool) {
        if escalated {
            self.tasks_escalated_total
                .with_label_values(&[queue, task])
                .inc();
        } else {
            self.retries_scheduled_total
                .with_label_values(&[queue, task])
                .inc();
        }
    }

    /// Record a retry record produced back onto its topic
    pub fn record_redelivered(&self, queue: &str, task: &str) {
        self.retries_redelivered_total
            .with_label_values(&[queue, task])
            .inc();
    }

    /// Observe a task execution time
    pub fn observe_duration(&self, queue: &str, task: &str, duration_secs: f64) {
        self.task_duration_seconds
            .with_label_values(&[queue, task])
            .observe(duration_secs);
    }

    /// Get the registry for custom metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").finish_non_exhaustive()
    }
}
