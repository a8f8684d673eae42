//! # relayq
//!
//! relayq is a broker-agnostic task queue with a durable retry store.
//!
//! ## Features
//!
//! - Redis stream, Redis list, Kafka (feature `kafka`) and in-memory brokers
//! - Failed deliveries parked in a retry store and produced again on schedule
//! - Dead letters once a task's retry limit is exhausted
//! - Several tasks multiplexed on one topic
//! - Onion-style middleware chains, pipelines and hooks
//! - Prometheus metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relayq::broker::RedisStreamBroker;
//! use relayq::processor::{handler_fn, TaskContext};
//! use relayq::retry::SqlRetryStore;
//! use relayq::server::{Registry, Runner};
//! use relayq::storage::RedisClient;
//! use relayq::{Queue, Settings, Shutdown, TaskOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Email {
//!     email: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env()?;
//!     let redis = RedisClient::from_url(&settings.redis_url).await?;
//!
//!     let queue = Queue::<Email>::define("email")
//!         .broker(RedisStreamBroker::new(redis))
//!         .retry_store(SqlRetryStore::from_settings(&settings).await?)
//!         .add_task(
//!             "send",
//!             handler_fn(|_ctx: TaskContext, mail: Email| async move {
//!                 tracing::info!("sending to {}", mail.email);
//!                 Ok(())
//!             }),
//!             TaskOptions::new(5, 15),
//!         )
//!         .build()?;
//!
//!     // Producer side
//!     queue.send(&Email { email: "a@b.com".into() }).await?;
//!
//!     // Consumer side
//!     let mut registry = Registry::new();
//!     registry.register(queue.commands())?;
//!     let runner = Runner::new(registry, Shutdown::new());
//!     let names = vec!["all".to_string()];
//!     tokio::try_join!(runner.run(&names, 2), runner.run_retry(&names))?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Public module exports
pub mod config;
pub mod error;
pub mod serializer;
pub mod shutdown;
pub mod task;

// Message transport
pub mod broker;

// Durable retry backlog
pub mod retry;

// Queue orchestration
pub mod queue;

// Commands, registry and runner
pub mod server;

// Processor
pub mod processor;

// Middleware
pub mod middleware;

// Storage layer
pub mod storage;

// Observability
pub mod observability;

// Re-export common types
pub use config::Settings;
pub use error::{Error, Result};
pub use queue::{Queue, QueueBuilder, TaskData};
pub use serializer::{Json, MsgPack, Serializer};
pub use shutdown::Shutdown;
pub use task::{Envelope, TaskOptions};
