//! Error type definitions
//!
//! Provides all error types surfaced by relayq queues, brokers and retry stores.

/// Result type alias for relayq
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for relayq
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Redis-related errors
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::RedisError),

    /// Retry store database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Task handler errors
    #[error("Handler error: {0}")]
    Handler(String),

    /// Task is not registered on the queue
    #[error("[queue.task] topic: {topic}, task: {task}, undefined")]
    UndefinedTask {
        /// Queue topic
        topic: String,
        /// Task name
        task: String,
    },

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Build a handler error from anything printable
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Error::Handler(message.to_string())
    }

    /// Check if the error belongs to the transport class
    ///
    /// Transport errors are retried by the consume loops themselves and are
    /// never written to the retry store.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Redis(_) | Error::Connection(_) => true,
            #[cfg(feature = "kafka")]
            Error::Kafka(_) => true,
            _ => false,
        }
    }

    /// Check if the error is fatal (non-recoverable)
    ///
    /// A fatal error comes from how a queue was put together and repeats on
    /// every attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::UndefinedTask { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}
