//! Named hooks
//!
//! A hook declares its slot names up front. Middleware is attached to a slot by
//! name and always runs in declaration order, whatever order it was attached
//! in. Notify handlers run after the chain, only when it succeeded.

use super::{Chain, Middleware, Noop};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Listener invoked after a successful emit
#[async_trait]
pub trait NotifyHandler<D: Send + Sync>: Send + Sync {
    /// Observe the final data
    async fn notify(&self, data: &D) -> Result<()>;
}

/// Ordered named extension point
pub struct Hook<D: Send + Sync + 'static> {
    names: Vec<String>,
    slots: HashMap<String, Arc<dyn Middleware<D>>>,
    chain: Chain<D>,
    listeners: Vec<Arc<dyn NotifyHandler<D>>>,
}

impl<D: Send + Sync + 'static> Hook<D> {
    /// Declare a hook with its slot names, in execution order
    pub fn define<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            slots: HashMap::new(),
            chain: Chain::new(),
            listeners: Vec::new(),
        }
    }

    /// Attach middleware to a declared slot
    ///
    /// Attaching twice to the same slot replaces the earlier middleware.
    pub fn add<M: Middleware<D> + 'static>(&mut self, name: &str, middleware: M) -> Result<()> {
        if !self.names.iter().any(|n| n == name) {
            return Err(Error::Config(format!("hook slot '{}' is undefined", name)));
        }
        self.slots.insert(name.to_string(), Arc::new(middleware));

        let mut chain = Chain::new();
        for name in &self.names {
            if let Some(middleware) = self.slots.get(name) {
                chain.push_arc(middleware.clone());
            }
        }
        self.chain = chain;
        Ok(())
    }

    /// Add a listener run after every successful emit
    #[must_use]
    pub fn notify<N: NotifyHandler<D> + 'static>(mut self, listener: N) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Declared slot names
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Run attached middleware in slot order, then the listeners
    pub async fn emit(&self, data: &mut D) -> Result<()> {
        self.chain.dispatch(data, &Noop).await?;

        for listener in &self.listeners {
            listener.notify(data).await?;
        }
        Ok(())
    }
}
