//! Request pipeline
//!
//! Wraps a typed service call in a middleware chain. The payload carries the
//! input and, once the service ran, its output, so middleware can validate the
//! input before calling `next` or rewrite the output after it.

use super::{Chain, Endpoint, Middleware};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Typed base operation of a pipeline
#[async_trait]
pub trait Service<In, Out>: Send + Sync {
    /// Produce an output for `input`
    async fn call(&self, input: &In) -> Result<Out>;
}

/// Data flowing through a pipeline
#[derive(Debug, Clone)]
pub struct Payload<In, Out> {
    /// Route or operation name
    pub path: String,
    /// Free-form request metadata (headers, caller identity...)
    pub metadata: HashMap<String, String>,
    /// Request input
    pub input: In,
    /// Service output, set once the endpoint has run
    pub output: Option<Out>,
}

impl<In, Out> Payload<In, Out> {
    /// Create a payload for `path` carrying `input`
    pub fn new(path: impl Into<String>, input: In) -> Self {
        Self {
            path: path.into(),
            metadata: HashMap::new(),
            input,
            output: None,
        }
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

struct ServiceEndpoint<In, Out> {
    service: Arc<dyn Service<In, Out>>,
}

#[async_trait]
impl<In, Out> Endpoint<Payload<In, Out>> for ServiceEndpoint<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    async fn call(&self, payload: &mut Payload<In, Out>) -> Result<()> {
        let output = self.service.call(&payload.input).await?;
        payload.output = Some(output);
        Ok(())
    }
}

/// Service plus the middleware wrapped around it
pub struct Pipeline<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    path: String,
    chain: Chain<Payload<In, Out>>,
    endpoint: ServiceEndpoint<In, Out>,
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    /// Create a pipeline serving `path` with `service`
    pub fn new<S: Service<In, Out> + 'static>(path: impl Into<String>, service: S) -> Self {
        Self {
            path: path.into(),
            chain: Chain::new(),
            endpoint: ServiceEndpoint {
                service: Arc::new(service),
            },
        }
    }

    /// Append middleware
    #[must_use]
    pub fn with<M: Middleware<Payload<In, Out>> + 'static>(mut self, middleware: M) -> Self {
        self.chain.push(middleware);
        self
    }

    /// Put an inherited chain in front of this pipeline's own middleware
    #[must_use]
    pub fn inherit(mut self, parent: &Chain<Payload<In, Out>>) -> Self {
        self.chain = parent.nested(&self.chain);
        self
    }

    /// Path served by this pipeline
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run the payload through the chain and return it
    pub async fn handle(&self, mut payload: Payload<In, Out>) -> Result<Payload<In, Out>> {
        self.chain.dispatch(&mut payload, &self.endpoint).await?;
        Ok(payload)
    }

    /// Run `input` through the chain and return the output
    ///
    /// A chain that stops before the service and sets no output is reported as
    /// a handler error.
    pub async fn call(&self, input: In) -> Result<Out> {
        let payload = self.handle(Payload::new(self.path.clone(), input)).await?;
        payload
            .output
            .ok_or_else(|| Error::handler(format!("{}: chain produced no output", self.path)))
    }
}
