//! Processor module
//!
//! Provides the task handler trait and a closure adapter.

pub mod context;

pub use context::TaskContext;

use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Handler trait - Task processor
///
/// # Example
///
/// ```rust
/// use relayq::processor::{TaskContext, TaskHandler};
/// use async_trait::async_trait;
///
/// struct Welcome;
///
/// #[async_trait]
/// impl TaskHandler<String> for Welcome {
///     async fn handle(&self, ctx: &TaskContext, email: &String) -> relayq::Result<()> {
///         if email.is_empty() {
///             return Err(relayq::Error::handler("empty address"));
///         }
///         tracing::info!("[{}] sending welcome to {}", ctx.task(), email);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler<D>: Send + Sync {
    /// Handle one delivery
    async fn handle(&self, ctx: &TaskContext, data: &D) -> Result<()>;
}

/// Handler built from an async closure
pub struct HandlerFn<F, D> {
    f: F,
    _data: PhantomData<fn(D)>,
}

/// Wrap an async closure taking owned context and data
pub fn handler_fn<F, Fut, D>(f: F) -> HandlerFn<F, D>
where
    F: Fn(TaskContext, D) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
    D: Clone + Send + Sync,
{
    HandlerFn {
        f,
        _data: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, D> TaskHandler<D> for HandlerFn<F, D>
where
    F: Fn(TaskContext, D) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
    D: Clone + Send + Sync,
{
    async fn handle(&self, ctx: &TaskContext, data: &D) -> Result<()> {
        (self.f)(ctx.clone(), data.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_closure_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |ctx: TaskContext, n: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
                if ctx.retry_count() > 0 {
                    return Err(Error::handler("retry"));
                }
                Ok(())
            }
        });

        let fresh = TaskContext::new("users", "welcome", 0);
        handler.handle(&fresh, &3).await.unwrap();
        let retried = TaskContext::new("users", "welcome", 1);
        assert!(handler.handle(&retried, &4).await.is_err());

        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }
}
