//! Messages carried by the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use weft_core::{AgentId, Topic};
use weft_memory::RefOrValue;

use crate::error::MeshResult;

/// Message type used when the publisher does not declare one
pub const DEFAULT_MESSAGE_TYPE: &str = "text";

/// Unique identifier for a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a publisher hands to [`MessageBus::publish`](crate::MessageBus::publish).
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub from: Option<AgentId>,
    /// Declared type; drives tier policy in the reference store.
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            from: None,
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text.into().into_bytes())
    }

    pub fn json<T: Serialize>(value: &T) -> MeshResult<Self> {
        Ok(Self::new(serde_json::to_vec(value)?).with_type("json"))
    }

    pub fn from_agent(mut self, agent: AgentId) -> Self {
        self.from = Some(agent);
        self
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A published message as seen by subscribers.
///
/// Large payloads are not inlined: `body` holds a reference handle that
/// [`Delivery::payload`](crate::Delivery::payload) resolves lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: MessageId,
    pub topic: Topic,
    pub from: Option<AgentId>,
    /// Position in the stream of `(topic, from)`, starting at 1.
    pub sequence: u64,
    pub message_type: String,
    pub body: RefOrValue,
    pub metadata: BTreeMap<String, String>,
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_from(&self, agent: &AgentId) -> bool {
        self.from.as_ref() == Some(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_builder() {
        let msg = OutgoingMessage::text("hello")
            .from_agent(AgentId::new_unchecked("a"))
            .with_type("control")
            .with_metadata("iteration", "2");
        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.message_type, "control");
        assert_eq!(msg.metadata.get("iteration").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_json_message_type() {
        let msg = OutgoingMessage::json(&serde_json::json!({"x": 1})).unwrap();
        assert_eq!(msg.message_type, "json");
        assert_eq!(msg.payload, br#"{"x":1}"#);
    }

    #[test]
    fn test_message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }
}
