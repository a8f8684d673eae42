//! Redis Key manager
//!
//! Provides unified Redis key naming convention.

/// Redis Key prefix
const PREFIX: &str = "relayq";

/// Redis Key manager
#[derive(Debug, Clone)]
pub struct Keys;

impl Keys {
    /// Stream backing a topic (Stream)
    /// Example: relayq:stream:users
    pub fn stream(topic: &str) -> String {
        format!("{}:stream:{}", PREFIX, topic)
    }

    /// List backing a topic (List)
    /// Example: relayq:list:users
    pub fn list(topic: &str) -> String {
        format!("{}:list:{}", PREFIX, topic)
    }
}
