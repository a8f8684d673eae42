//! Storage layer
//!
//! Redis connection handling and key naming shared by the Redis brokers.

pub mod keys;
pub mod redis;

pub use keys::Keys;
pub use redis::{RedisClient, RedisConfig, StreamEntry, StreamTrim};
