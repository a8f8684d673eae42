//! Middleware module
//!
//! Onion-style dispatcher with an explicit continuation. A [`Chain`] holds an
//! ordered list of [`Middleware`]; dispatching calls the first one with a
//! [`Next`] that, when run, calls the following one, and finally the
//! [`Endpoint`]. A middleware may:
//!
//! - call `next.run(payload)` once (the usual case), several times, or never;
//! - inspect or mutate the payload before and after the continuation;
//! - return an error, which stops the rest of the chain and reaches the caller.
//!
//! Nothing here retries or swallows errors.

pub mod hook;
pub mod pipeline;

pub use hook::{Hook, NotifyHandler};
pub use pipeline::{Payload, Pipeline, Service};

use crate::observability::QueueMetrics;
use crate::task::TaskPayload;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Middleware trait
#[async_trait]
pub trait Middleware<P: Send>: Send + Sync {
    /// Handle the payload; call `next.run(payload)` to continue the chain
    async fn handle(&self, payload: &mut P, next: Next<'_, P>) -> Result<()>;
}

/// Terminal operation of a chain
#[async_trait]
pub trait Endpoint<P: Send>: Send + Sync {
    /// Run the base operation
    async fn call(&self, payload: &mut P) -> Result<()>;
}

/// Endpoint that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl<P: Send> Endpoint<P> for Noop {
    async fn call(&self, _payload: &mut P) -> Result<()> {
        Ok(())
    }
}

/// Type-erased middleware wrapper
type MiddlewareArc<P> = Arc<dyn Middleware<P>>;

/// Continuation handed to each middleware
pub struct Next<'a, P: Send> {
    rest: &'a [MiddlewareArc<P>],
    endpoint: &'a dyn Endpoint<P>,
}

impl<P: Send> Clone for Next<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Send> Copy for Next<'_, P> {}

impl<'a, P: Send> Next<'a, P> {
    /// Invoke the rest of the chain, ending with the endpoint
    pub async fn run(&self, payload: &mut P) -> Result<()> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                let next = Next {
                    rest: tail,
                    endpoint: self.endpoint,
                };
                head.handle(payload, next).await
            }
            None => self.endpoint.call(payload).await,
        }
    }

    /// Number of middleware still ahead of the endpoint
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

/// Middleware chain
///
/// Executes middleware in the order they were added.
pub struct Chain<P: Send> {
    middlewares: Vec<MiddlewareArc<P>>,
}

impl<P: Send> Clone for Chain<P> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
        }
    }
}

impl<P: Send> Default for Chain<P> {
    fn default() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }
}

impl<P: Send> std::fmt::Debug for Chain<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("count", &self.middlewares.len())
            .finish()
    }
}

impl<P: Send + 'static> Chain<P> {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Add middleware to the chain (builder style)
    #[must_use]
    pub fn with<M: Middleware<P> + 'static>(mut self, middleware: M) -> Self {
        self.push(middleware);
        self
    }

    /// Add middleware to the chain
    pub fn push<M: Middleware<P> + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Add an already shared middleware
    pub fn push_arc(&mut self, middleware: Arc<dyn Middleware<P>>) {
        self.middlewares.push(middleware);
    }

    /// Compose with a child chain: this chain's middleware run first
    ///
    /// Used for tree-shaped routing where a node inherits every ancestor's
    /// middleware, root to leaf.
    pub fn nested(&self, child: &Chain<P>) -> Chain<P> {
        let mut middlewares = Vec::with_capacity(self.middlewares.len() + child.middlewares.len());
        middlewares.extend(self.middlewares.iter().cloned());
        middlewares.extend(child.middlewares.iter().cloned());
        Chain { middlewares }
    }

    /// Run the chain against `endpoint`
    pub async fn dispatch(&self, payload: &mut P, endpoint: &dyn Endpoint<P>) -> Result<()> {
        let next = Next {
            rest: &self.middlewares,
            endpoint,
        };
        next.run(payload).await
    }

    /// Number of middleware in the chain
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if chain is empty
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// Logging middleware - logs task processing
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware {
    log_details: bool,
}

impl LoggingMiddleware {
    /// Create a new logging middleware
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable detailed logging
    #[must_use]
    pub fn with_details(mut self) -> Self {
        self.log_details = true;
        self
    }
}

#[async_trait]
impl<D: Send + Sync> Middleware<TaskPayload<D>> for LoggingMiddleware {
    async fn handle(
        &self,
        payload: &mut TaskPayload<D>,
        next: Next<'_, TaskPayload<D>>,
    ) -> Result<()> {
        let ctx = payload.context.clone();
        if self.log_details {
            tracing::info!(
                "Processing task: topic={}, task={}, retry={}",
                ctx.topic(),
                ctx.task(),
                ctx.retry_count()
            );
        } else {
            tracing::debug!("Processing task: {}:{}", ctx.topic(), ctx.task());
        }

        let result = next.run(payload).await;
        match &result {
            Ok(()) => tracing::debug!("Task completed: {}:{}", ctx.topic(), ctx.task()),
            Err(e) => tracing::debug!("Task failed: {}:{} - error: {}", ctx.topic(), ctx.task(), e),
        }
        result
    }
}

/// Metrics middleware - times task execution
#[derive(Clone)]
pub struct MetricsMiddleware {
    metrics: Arc<QueueMetrics>,
}

impl MetricsMiddleware {
    /// Create a metrics middleware reporting into `metrics`
    pub fn new(metrics: Arc<QueueMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl<D: Send + Sync> Middleware<TaskPayload<D>> for MetricsMiddleware {
    async fn handle(
        &self,
        payload: &mut TaskPayload<D>,
        next: Next<'_, TaskPayload<D>>,
    ) -> Result<()> {
        let started = Instant::now();
        let result = next.run(payload).await;
        let ctx = &payload.context;
        self.metrics
            .observe_duration(ctx.topic(), ctx.task(), started.elapsed().as_secs_f64());
        result
    }
}
