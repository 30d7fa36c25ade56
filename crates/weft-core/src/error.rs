//! Error types for agent invocation, tools and configuration.

use std::time::Duration;
use thiserror::Error;

use crate::types::IdValidationError;

/// Errors raised by an agent's chat capability.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent (or its upstream LLM) failed to produce a response.
    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    /// The agent did not respond in time.
    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    /// The response could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A tool call made by the agent failed fatally.
    #[error("Tool '{tool}' failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolError,
    },

    /// A tool with the same name is already registered.
    #[error("Tool already registered: {0}")]
    ToolAlreadyRegistered(String),

    /// The agent does not accept tool registration.
    #[error("Agent does not support tools")]
    ToolsUnsupported,
}

impl AgentError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Timeout(_) | AgentError::InvocationFailed(_))
    }

    /// Get the error code suitable for logging or reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            AgentError::InvocationFailed(_) => "INVOCATION_FAILED",
            AgentError::Timeout(_) => "TIMEOUT",
            AgentError::InvalidResponse(_) => "INVALID_RESPONSE",
            AgentError::Tool { .. } => "TOOL_FAILED",
            AgentError::ToolAlreadyRegistered(_) => "TOOL_ALREADY_REGISTERED",
            AgentError::ToolsUnsupported => "TOOLS_UNSUPPORTED",
        }
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors returned by tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool input did not match its schema.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The tool ran but failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The requested item does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::InvalidInput(err.to_string())
    }
}

/// Result type for tool execution.
pub type ToolResult<T> = Result<T, ToolError>;

/// Configuration errors, detected before anything runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// An identifier or topic pattern is malformed.
    #[error("Invalid identifier in '{field}': {source}")]
    Identifier {
        field: String,
        #[source]
        source: IdValidationError,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
