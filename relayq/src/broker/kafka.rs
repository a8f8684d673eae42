//! Kafka broker
//!
//! Partitioned log with consumer groups. Offsets are committed per message
//! and only after the handler succeeded; auto-commit is off. Rebalances are
//! handled inside the client.

use super::{Broker, MessageHandler, TRANSPORT_BACKOFF};
use crate::config::Settings;
use crate::shutdown::Shutdown;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Kafka driver configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Delivery timeout for produced messages
    pub produce_timeout: Duration,
    /// Extra librdkafka properties applied to producer and consumers
    pub properties: HashMap<String, String>,
}

impl KafkaConfig {
    /// Configuration for the given bootstrap servers
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            produce_timeout: Duration::from_secs(5),
            properties: HashMap::new(),
        }
    }

    /// Configuration from settings; fails when no brokers are configured
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings
            .kafka_brokers
            .as_deref()
            .map(Self::new)
            .ok_or_else(|| Error::Config("kafka brokers are not configured".into()))
    }

    /// Set an extra client property
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

/// Split a comma-separated topic list
fn split_topics(topic: &str) -> Vec<&str> {
    topic
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Kafka broker
pub struct KafkaBroker {
    config: KafkaConfig,
    producer: FutureProducer,
}

impl KafkaBroker {
    /// Create the broker and its shared producer
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .client_config()
            .set("message.timeout.ms", config.produce_timeout.as_millis().to_string())
            .create()?;
        Ok(Self { config, producer })
    }

    fn consumer(&self, group: &str) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = self
            .config
            .client_config()
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        Ok(consumer)
    }
}

impl std::fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("brokers", &self.config.brokers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn produce(&self, topic: &str, raw: &[u8]) -> Result<()> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(raw);
        self.producer
            .send(record, Timeout::After(self.config.produce_timeout))
            .await
            .map_err(|(e, _message)| Error::from(e))?;
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        group: &str,
        handler: &dyn MessageHandler,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let consumer = self.consumer(group)?;
        consumer.subscribe(&split_topics(topic))?;
        debug!("[kafka] subscribed topic: {}, group: {}", topic, group);

        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }

            let received = tokio::select! {
                received = consumer.recv() => received,
                _ = shutdown.triggered() => return Ok(()),
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    warn!("[kafka.fetch] topic: {}, group: {}, error: {}", topic, group, e);
                    if shutdown.sleep(TRANSPORT_BACKOFF).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let payload = message.payload().unwrap_or_default();
            if handler.handle(payload).await.is_err() {
                continue;
            }
            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                warn!(
                    "[kafka.commit] topic: {}, group: {}, offset: {}, error: {}",
                    topic,
                    group,
                    message.offset(),
                    e
                );
            }
        }
    }
}
