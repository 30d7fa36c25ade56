//! Error types for bus operations

use std::time::Duration;
use thiserror::Error;

use weft_core::{AgentId, IdValidationError, Topic};
use weft_memory::MemoryError;

use crate::subscription::SubscriptionId;

/// Result type for bus operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during bus operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// A subscriber queue was full and the publish could not wait
    #[error("Queue full on topic '{topic}' for subscriber '{agent}' (capacity {capacity})")]
    QueueFull {
        topic: Topic,
        agent: AgentId,
        capacity: usize,
    },

    /// A critical publish waited past its send timeout
    #[error("Publish to '{topic}' timed out after {waited:?} waiting on subscriber '{agent}'")]
    Timeout {
        topic: Topic,
        agent: AgentId,
        waited: Duration,
    },

    /// The bus has been closed
    #[error("Message bus is closed")]
    BusClosed,

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] IdValidationError),

    /// Payload storage or resolution failed
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl MeshError {
    /// Check if this error is transient
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::QueueFull { .. } | MeshError::Timeout { .. } => true,
            MeshError::Memory(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get the error code suitable for logging or reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshError::QueueFull { .. } => "QUEUE_FULL",
            MeshError::Timeout { .. } => "PUBLISH_TIMEOUT",
            MeshError::BusClosed => "BUS_CLOSED",
            MeshError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            MeshError::InvalidTopic(_) => "INVALID_TOPIC",
            MeshError::Memory(e) => e.error_code(),
            MeshError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}
