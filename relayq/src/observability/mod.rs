//! Observability module
//!
//! Prometheus metrics for queues. Logging goes through `tracing` directly.

pub mod metrics;

pub use metrics::{FailureKind, QueueMetrics};
