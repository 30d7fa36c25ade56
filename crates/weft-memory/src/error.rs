//! Error types for the reference store and shared memory.

use thiserror::Error;

use crate::reference::ReferenceId;

/// Errors that can occur in the memory layer.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The reference id was never issued by this store.
    #[error("Reference not found: {0}")]
    ReferenceNotFound(ReferenceId),

    /// The reference exists but its TTL has elapsed.
    #[error("Reference expired: {0}")]
    ReferenceExpired(ReferenceId),

    /// The reference was valid once but has been released and collected.
    #[error("Reference collected: {0}")]
    ReferenceCollected(ReferenceId),

    /// Release was called on a reference whose count is already zero.
    #[error("Reference {0} released more times than retained")]
    ReleaseUnderflow(ReferenceId),

    #[error("Shared memory entry not found: {0}")]
    EntryNotFound(String),

    #[error("Shared memory entry expired: {0}")]
    EntryExpired(String),

    /// An agent-private entry was touched by another agent.
    #[error("Agent '{agent}' may not access '{key}'")]
    AccessDenied { key: String, agent: String },

    #[error("Version conflict on '{key}': expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Neither memory nor disk can take the payload.
    #[error("{tier} capacity exhausted: requested {requested} bytes, limit {limit} bytes")]
    CapacityExhausted {
        tier: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error("Checksum mismatch for '{0}'")]
    ChecksumMismatch(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl MemoryError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MemoryError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether a reference lookup failed because the data is gone, as opposed
    /// to never having existed.
    pub fn is_missing_reference(&self) -> bool {
        matches!(
            self,
            MemoryError::ReferenceExpired(_) | MemoryError::ReferenceCollected(_)
        )
    }

    /// Check if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::Io { .. } | MemoryError::CapacityExhausted { .. } | MemoryError::Backend(_)
        )
    }

    /// Get the error code suitable for logging or reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            MemoryError::ReferenceNotFound(_) => "REFERENCE_NOT_FOUND",
            MemoryError::ReferenceExpired(_) => "REFERENCE_EXPIRED",
            MemoryError::ReferenceCollected(_) => "REFERENCE_COLLECTED",
            MemoryError::ReleaseUnderflow(_) => "RELEASE_UNDERFLOW",
            MemoryError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            MemoryError::EntryExpired(_) => "ENTRY_EXPIRED",
            MemoryError::AccessDenied { .. } => "ACCESS_DENIED",
            MemoryError::VersionConflict { .. } => "VERSION_CONFLICT",
            MemoryError::CapacityExhausted { .. } => "CAPACITY_EXHAUSTED",
            MemoryError::ChecksumMismatch(_) => "CHECKSUM_MISMATCH",
            MemoryError::Compression(_) => "COMPRESSION_ERROR",
            MemoryError::Io { .. } => "IO_ERROR",
            MemoryError::Serialization(_) => "SERIALIZATION_ERROR",
            MemoryError::Backend(_) => "BACKEND_ERROR",
            MemoryError::InvalidQuery(_) => "INVALID_QUERY",
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
