//! Broker drivers
//!
//! A broker moves raw message bytes between producers and consumers. Drivers
//! never decode messages and never retry a failed delivery themselves: a
//! handler error leaves the message unacknowledged and the queue's retry
//! store takes over.
//!
//! | Driver | Family | Acknowledgement |
//! |---|---|---|
//! | [`RedisStreamBroker`] | append log with consumer groups | `XACK` on success |
//! | [`RedisListBroker`] | list queue, no groups | the pop itself |
//! | `KafkaBroker` (feature `kafka`) | partitioned log | offset commit on success |
//! | [`MemoryBroker`] | in-process append log with groups | cursor ack on success |

pub mod list;
pub mod memory;
pub mod stream;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use list::{ListConfig, RedisListBroker};
pub use memory::MemoryBroker;
pub use stream::{RedisStreamBroker, StreamConfig};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaConfig};

use crate::shutdown::Shutdown;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Pause after a transport error before fetching again
pub const TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

/// Per-message callback invoked by [`Broker::consume`]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery; `Ok` lets the driver acknowledge it
    async fn handle(&self, raw: &[u8]) -> Result<()>;
}

/// Broker driver
#[async_trait]
pub trait Broker: Send + Sync {
    /// Driver name, used in logs
    fn name(&self) -> &'static str;

    /// Append one message to `topic`
    ///
    /// Safe to call concurrently.
    async fn produce(&self, topic: &str, raw: &[u8]) -> Result<()>;

    /// Deliver every message of `topic` to `handler` as member of `group`
    ///
    /// Runs until `shutdown` is triggered, then returns `Ok(())`. Retryable
    /// transport errors are logged and followed by a one second pause; any
    /// other error ends the loop.
    async fn consume(
        &self,
        topic: &str,
        group: &str,
        handler: &dyn MessageHandler,
        shutdown: &Shutdown,
    ) -> Result<()>;
}
