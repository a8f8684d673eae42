//! Queue module
//!
//! A queue binds a topic to a broker, a retry store, a serializer and one or
//! more named tasks. Every task consumes the topic as its own consumer group,
//! so an unaddressed message reaches every task of the queue while a retried
//! message, addressed to the task that failed it, is only handled there.
//!
//! # Example
//!
//! ```rust,no_run
//! use relayq::broker::MemoryBroker;
//! use relayq::processor::{handler_fn, TaskContext};
//! use relayq::retry::MemoryRetryStore;
//! use relayq::{Queue, Shutdown, TaskOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Signup {
//!     email: String,
//! }
//!
//! # async fn example() -> relayq::Result<()> {
//! let queue = Queue::<Signup>::define("users")
//!     .broker(MemoryBroker::new())
//!     .retry_store(MemoryRetryStore::new())
//!     .add_task(
//!         "welcome",
//!         handler_fn(|_ctx: TaskContext, signup: Signup| async move {
//!             tracing::info!("welcome {}", signup.email);
//!             Ok(())
//!         }),
//!         TaskOptions::new(3, 10),
//!     )
//!     .build()?;
//!
//! queue.send(&Signup { email: "a@b.com".into() }).await?;
//! queue.run_task("welcome", &Shutdown::new()).await?;
//! # Ok(())
//! # }
//! ```

use crate::broker::{Broker, MessageHandler};
use crate::middleware::{Chain, Endpoint, Middleware, MetricsMiddleware};
use crate::observability::{FailureKind, QueueMetrics};
use crate::processor::{TaskContext, TaskHandler};
use crate::retry::{RetryPush, RetryRecord, RetryStore};
use crate::serializer::{Json, Serializer};
use crate::server::Command;
use crate::shutdown::Shutdown;
use crate::task::{Envelope, TaskDefinition, TaskOptions, TaskPayload};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Bound shared by every queue payload type
pub trait TaskData: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> TaskData for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

struct QueueInner<D: TaskData, S> {
    name: String,
    broker: Arc<dyn Broker>,
    retry_store: Arc<dyn RetryStore>,
    serializer: S,
    tasks: BTreeMap<String, TaskDefinition<D>>,
    chain: Chain<TaskPayload<D>>,
    metrics: Option<Arc<QueueMetrics>>,
}

/// Task queue
///
/// Cheap to clone; clones share everything. Tasks are fixed once built.
pub struct Queue<D: TaskData, S = Json> {
    inner: Arc<QueueInner<D, S>>,
}

impl<D: TaskData, S> Clone for Queue<D, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: TaskData, S: Serializer> std::fmt::Debug for Queue<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("broker", &self.inner.broker.name())
            .field("retry_store", &self.inner.retry_store.name())
            .field("serializer", &self.inner.serializer.name())
            .field("tasks", &self.inner.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<D: TaskData> Queue<D, Json> {
    /// Start defining a queue on topic `name`
    pub fn define(name: impl Into<String>) -> QueueBuilder<D, Json> {
        QueueBuilder {
            name: name.into(),
            broker: None,
            retry_store: None,
            serializer: Json,
            tasks: Vec::new(),
            middlewares: Vec::new(),
            metrics: None,
        }
    }
}

impl<D: TaskData, S: Serializer> Queue<D, S> {
    /// Topic name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registered task names, sorted
    pub fn task_names(&self) -> Vec<String> {
        self.inner.tasks.keys().cloned().collect()
    }

    /// Options of a registered task
    pub fn task_options(&self, task: &str) -> Option<TaskOptions> {
        self.inner.tasks.get(task).map(|t| t.options)
    }

    /// Serializer in use
    pub fn serializer(&self) -> &S {
        &self.inner.serializer
    }

    fn task(&self, name: &str) -> Result<&TaskDefinition<D>> {
        self.inner.tasks.get(name).ok_or_else(|| Error::UndefinedTask {
            topic: self.inner.name.clone(),
            task: name.to_string(),
        })
    }

    /// Produce an unaddressed message, handled by every task of the queue
    pub async fn send(&self, data: &D) -> Result<()> {
        self.produce(&Envelope::new(data)).await
    }

    /// Produce a message addressed to a single task
    pub async fn send_task(&self, task: &str, data: &D) -> Result<()> {
        let task = self.task(task)?;
        self.produce(&Envelope::addressed(task.name.clone(), data)).await
    }

    async fn produce(&self, envelope: &Envelope<&D>) -> Result<()> {
        let raw = self.inner.serializer.encode(envelope)?;
        self.inner.broker.produce(&self.inner.name, &raw).await?;
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_produced(&self.inner.name);
        }
        Ok(())
    }

    /// Consume the topic for `task` until `shutdown` is triggered
    pub async fn run_task(&self, task: &str, shutdown: &Shutdown) -> Result<()> {
        let task = self.task(task)?;
        self.inner.retry_store.init(&self.inner.name, &task.name).await?;

        let consumer = TaskConsumer {
            queue: self,
            task,
            shutdown,
        };
        let result = self
            .inner
            .broker
            .consume(&self.inner.name, &task.name, &consumer, shutdown)
            .await;

        if let Err(e) = &result {
            error!(
                "[queue.task] topic: {}, task: {}, error: {}",
                self.inner.name, task.name, e
            );
        }
        result
    }

    /// Produce every due retry record of `task` back onto the topic
    ///
    /// Returns the number of records re-injected.
    pub async fn run_retry_task(&self, task: &str) -> Result<usize> {
        let task = self.task(task)?;
        self.inner.retry_store.init(&self.inner.name, &task.name).await?;

        let push = RetryProducer { queue: self, task };
        self.inner
            .retry_store
            .run(&self.inner.name, &task.name, &push)
            .await
    }

    /// Stored retry records of `task`, dead letters included
    pub async fn retries(&self, task: &str) -> Result<Vec<RetryRecord>> {
        let task = self.task(task)?;
        self.inner.retry_store.list(&self.inner.name, &task.name).await
    }

    /// One `topic:task` command per task
    pub fn commands(&self) -> Vec<Command> {
        self.inner
            .tasks
            .keys()
            .map(|task| {
                let run_queue = self.clone();
                let run_task = task.clone();
                let retry_queue = self.clone();
                let retry_task = task.clone();
                Command::new(
                    format!("{}:{}", self.inner.name, task),
                    move |shutdown: Shutdown| {
                        let queue = run_queue.clone();
                        let task = run_task.clone();
                        async move { queue.run_task(&task, &shutdown).await }
                    },
                    move || {
                        let queue = retry_queue.clone();
                        let task = retry_task.clone();
                        async move { queue.run_retry_task(&task).await }
                    },
                )
            })
            .collect()
    }

    /// Handle one raw delivery for `task`
    ///
    /// `Ok` means the broker may acknowledge: the message was handled, was
    /// addressed to another task, or its failure is safely in the retry store.
    pub(crate) async fn handle_message(
        &self,
        task: &TaskDefinition<D>,
        raw: &[u8],
        shutdown: &Shutdown,
    ) -> Result<()> {
        let envelope: Envelope<D> = match self.inner.serializer.decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => return self.handle_decode_error(task, raw, e).await,
        };

        if !envelope.is_for(&task.name) {
            return Ok(());
        }

        let context = TaskContext::new(&self.inner.name, &task.name, envelope.retry_count)
            .with_shutdown(shutdown.clone());
        let mut payload = TaskPayload {
            context,
            data: envelope.data,
        };
        let endpoint = HandlerEndpoint {
            handler: task.handler.clone(),
        };

        match self.inner.chain.dispatch(&mut payload, &endpoint).await {
            Ok(()) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_processed(&self.inner.name, &task.name);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_failed(&self.inner.name, &task.name, FailureKind::Handler);
                }
                let envelope = Envelope {
                    task: task.name.clone(),
                    data: payload.data,
                    retry_count: payload.context.retry_count(),
                };
                self.handle_task_error(task, envelope, &e.to_string()).await
            }
        }
    }

    /// Record a message whose payload did not decode as `D`
    ///
    /// The envelope is read again as a generic value to keep its address and
    /// retry count. Bytes that are not an envelope at all are kept verbatim.
    async fn handle_decode_error(
        &self,
        task: &TaskDefinition<D>,
        raw: &[u8],
        cause: Error,
    ) -> Result<()> {
        let envelope = match self.inner.serializer.decode::<Envelope<serde_json::Value>>(raw) {
            Ok(envelope) if !envelope.is_for(&task.name) => return Ok(()),
            Ok(envelope) => envelope,
            Err(_) => Envelope::new(raw_value(raw)),
        };

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_failed(&self.inner.name, &task.name, FailureKind::Decode);
        }
        self.handle_task_error(task, envelope, &cause.to_string()).await
    }

    /// Write a failed attempt to the retry store
    async fn handle_task_error<T: Serialize + Send>(
        &self,
        task: &TaskDefinition<D>,
        envelope: Envelope<T>,
        error_text: &str,
    ) -> Result<()> {
        warn!(
            "[queue.task] topic: {}, task: {}, error: {}",
            self.inner.name, task.name, error_text
        );

        let escalation = task.options.escalate(envelope.retry_count);
        let envelope = Envelope {
            task: task.name.clone(),
            data: envelope.data,
            retry_count: escalation.retry_count,
        };

        let raw = match self.inner.serializer.encode(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    "[queue.task] topic: {}, task: {}, error: {}",
                    self.inner.name, task.name, e
                );
                return Err(e);
            }
        };

        if let Err(e) = self
            .inner
            .retry_store
            .add(
                &self.inner.name,
                &task.name,
                &raw,
                error_text,
                task.options.retry_interval_secs,
                escalation.is_failed,
            )
            .await
        {
            error!(
                "[retry.add] topic: {}, task: {}, error: {}",
                self.inner.name, task.name, e
            );
            return Err(e);
        }

        if escalation.is_failed {
            warn!(
                "[queue.task] topic: {}, task: {}, retries exhausted after {}",
                self.inner.name, task.name, escalation.retry_count
            );
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_retry_added(&self.inner.name, &task.name, escalation.is_failed);
        }
        Ok(())
    }
}

/// Broker callback bound to one task
struct TaskConsumer<'a, D: TaskData, S> {
    queue: &'a Queue<D, S>,
    task: &'a TaskDefinition<D>,
    shutdown: &'a Shutdown,
}

#[async_trait]
impl<'a, D: TaskData, S: Serializer> MessageHandler for TaskConsumer<'a, D, S> {
    async fn handle(&self, raw: &[u8]) -> Result<()> {
        self.queue.handle_message(self.task, raw, self.shutdown).await
    }
}

/// Retry-store callback producing records back onto the topic
struct RetryProducer<'a, D: TaskData, S> {
    queue: &'a Queue<D, S>,
    task: &'a TaskDefinition<D>,
}

#[async_trait]
impl<'a, D: TaskData, S: Serializer> RetryPush for RetryProducer<'a, D, S> {
    async fn push(&self, id: i64, message: &[u8]) -> Result<()> {
        let inner = &self.queue.inner;
        debug!(
            "[queue.retry] id: {}, topic: {}, task: {}",
            id, inner.name, self.task.name
        );
        inner.broker.produce(&inner.name, message).await?;
        if let Some(metrics) = &inner.metrics {
            metrics.record_redelivered(&inner.name, &self.task.name);
        }
        Ok(())
    }
}

/// Chain endpoint calling the task handler
struct HandlerEndpoint<D> {
    handler: Arc<dyn TaskHandler<D>>,
}

#[async_trait]
impl<D: Send + Sync + 'static> Endpoint<TaskPayload<D>> for HandlerEndpoint<D> {
    async fn call(&self, payload: &mut TaskPayload<D>) -> Result<()> {
        self.handler.handle(&payload.context, &payload.data).await
    }
}

/// Queue builder
pub struct QueueBuilder<D: TaskData, S = Json> {
    name: String,
    broker: Option<Arc<dyn Broker>>,
    retry_store: Option<Arc<dyn RetryStore>>,
    serializer: S,
    tasks: Vec<TaskDefinition<D>>,
    middlewares: Vec<Arc<dyn Middleware<TaskPayload<D>>>>,
    metrics: Option<Arc<QueueMetrics>>,
}

impl<D: TaskData, S: Serializer> QueueBuilder<D, S> {
    /// Set the broker driver
    #[must_use]
    pub fn broker<B: Broker + 'static>(mut self, broker: B) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Set an already shared broker driver
    #[must_use]
    pub fn shared_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the retry store
    #[must_use]
    pub fn retry_store<R: RetryStore + 'static>(mut self, store: R) -> Self {
        self.retry_store = Some(Arc::new(store));
        self
    }

    /// Set an already shared retry store
    #[must_use]
    pub fn shared_retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = Some(store);
        self
    }

    /// Replace the serializer (JSON by default)
    #[must_use]
    pub fn serializer<S2: Serializer>(self, serializer: S2) -> QueueBuilder<D, S2> {
        QueueBuilder {
            name: self.name,
            broker: self.broker,
            retry_store: self.retry_store,
            serializer,
            tasks: self.tasks,
            middlewares: self.middlewares,
            metrics: self.metrics,
        }
    }

    /// Register a task
    #[must_use]
    pub fn add_task<H: TaskHandler<D> + 'static>(
        mut self,
        name: impl Into<String>,
        handler: H,
        options: TaskOptions,
    ) -> Self {
        self.tasks
            .push(TaskDefinition::new(name, Arc::new(handler), options));
        self
    }

    /// Wrap every task execution in `middleware`, in registration order
    #[must_use]
    pub fn middleware<M: Middleware<TaskPayload<D>> + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Report into `metrics`
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the queue
    ///
    /// Fails when the name, broker or retry store is missing, or when a task
    /// name is empty or registered twice.
    pub fn build(self) -> Result<Queue<D, S>> {
        if self.name.is_empty() {
            return Err(Error::Config("queue name is required".into()));
        }
        let broker = self
            .broker
            .ok_or_else(|| Error::Config(format!("queue '{}': broker is required", self.name)))?;
        let retry_store = self
            .retry_store
            .ok_or_else(|| {
                Error::Config(format!("queue '{}': retry store is required", self.name))
            })?;

        let mut tasks = BTreeMap::new();
        for task in self.tasks {
            if task.name.is_empty() {
                return Err(Error::Config(format!("queue '{}': task name is required", self.name)));
            }
            if tasks.contains_key(&task.name) {
                return Err(Error::Config(format!(
                    "queue '{}': task '{}' registered twice",
                    self.name, task.name
                )));
            }
            tasks.insert(task.name.clone(), task);
        }

        let mut chain = Chain::new();
        if let Some(metrics) = &self.metrics {
            chain.push(MetricsMiddleware::new(metrics.clone()));
        }
        for middleware in self.middlewares {
            chain.push_arc(middleware);
        }

        Ok(Queue {
            inner: Arc::new(QueueInner {
                name: self.name,
                broker,
                retry_store,
                serializer: self.serializer,
                tasks,
                chain,
                metrics: self.metrics,
            }),
        })
    }
}

/// Undecodable bytes as a storable value
///
/// UTF-8 input becomes a string, anything else an array of byte values.
fn raw_value(raw: &[u8]) -> serde_json::Value {
    match std::str::from_utf8(raw) {
        Ok(text) => serde_json::Value::String(text.to_string()),
        Err(_) => serde_json::Value::Array(raw.iter().map(|&b| b.into()).collect()),
    }
}
