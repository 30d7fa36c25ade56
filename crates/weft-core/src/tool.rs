//! Tool capability exposed to agents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolResult;

/// A capability an agent may call while answering a chat turn.
///
/// Inputs and outputs are JSON values; the agent's LLM client is
/// responsible for mapping them onto provider-specific tool calls.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the unique name identifier for this tool.
    fn name(&self) -> &str;

    /// Returns a human-readable description of the tool.
    fn description(&self) -> &str {
        ""
    }

    /// Returns the JSON Schema for the tool's input, if it has one.
    fn input_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Execute the tool with the provided input.
    async fn call(&self, input: serde_json::Value) -> ToolResult<serde_json::Value>;
}

/// Record of one tool call made during a chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecution {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
