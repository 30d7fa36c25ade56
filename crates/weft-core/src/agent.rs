//! Agent capability and the handle the orchestrator drives it through.
//!
//! Weft does not implement inference. An [`Agent`] is anything that can
//! answer a chat turn within a session and accept tool registrations; the
//! [`AgentHandle`] wraps it with identity, busy/idle tracking and a record
//! of which tools were successfully registered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::{AgentError, AgentResult};
use crate::tool::{Tool, ToolExecution};
use crate::types::{AgentId, SessionId};

/// Token and cost accounting for one chat turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Response to one chat turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,
    #[serde(default)]
    pub usage: Usage,
    /// Model that produced the response, when the agent knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatResponse {
    /// Plain text response with no usage attached.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Names of the tools used during this turn, deduplicated, in call order.
    pub fn tools_used(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.tool_executions
            .iter()
            .filter(|exec| seen.insert(exec.tool_name.clone()))
            .map(|exec| exec.tool_name.clone())
            .collect()
    }
}

/// The chat capability consumed by the orchestrator.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Answer one turn of the given session.
    async fn chat(&self, session_id: &SessionId, input: &str) -> AgentResult<ChatResponse>;

    /// Make a tool available to the agent.
    fn register_tool(&self, tool: Arc<dyn Tool>) -> AgentResult<()>;

    /// Number of tools currently registered.
    fn tool_count(&self) -> usize;
}

/// Whether an agent is currently serving at least one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
}

/// A registered agent.
///
/// Handles are shared across concurrently running workflows, so the busy
/// state counts in-flight invocations rather than toggling a flag.
pub struct AgentHandle {
    id: AgentId,
    agent: Arc<dyn Agent>,
    in_flight: AtomicUsize,
    invocations: AtomicU64,
    registered_tools: RwLock<BTreeSet<String>>,
}

impl AgentHandle {
    pub fn new(id: AgentId, agent: Arc<dyn Agent>) -> Self {
        Self {
            id,
            agent,
            in_flight: AtomicUsize::new(0),
            invocations: AtomicU64::new(0),
            registered_tools: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Run one chat turn. The busy marker is cleared even if the returned
    /// future is dropped mid-call.
    pub async fn invoke(&self, session_id: &SessionId, input: &str) -> AgentResult<ChatResponse> {
        let _busy = BusyGuard::enter(&self.in_flight);
        self.invocations.fetch_add(1, Ordering::Relaxed);
        debug!(agent = %self.id, session = %session_id, input_len = input.len(), "Invoking agent");
        self.agent.chat(session_id, input).await
    }

    pub fn state(&self) -> AgentState {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            AgentState::Busy
        } else {
            AgentState::Idle
        }
    }

    /// Total invocations served since registration.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Register a tool with the wrapped agent and remember its name.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> AgentResult<()> {
        let name = tool.name().to_string();
        if self.has_tool(&name) {
            return Err(AgentError::ToolAlreadyRegistered(name));
        }
        self.agent.register_tool(tool)?;
        if let Ok(mut tools) = self.registered_tools.write() {
            tools.insert(name);
        }
        Ok(())
    }

    /// Whether a tool with this name was registered through the handle.
    pub fn has_tool(&self, name: &str) -> bool {
        self.registered_tools
            .read()
            .map(|tools| tools.contains(name))
            .unwrap_or(false)
    }

    pub fn tool_count(&self) -> usize {
        self.agent.tool_count()
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("invocations", &self.invocation_count())
            .finish()
    }
}

struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolResult;
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoAgent {
        tools: Mutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        async fn chat(&self, _session_id: &SessionId, input: &str) -> AgentResult<ChatResponse> {
            tokio::time::sleep(self.delay).await;
            Ok(ChatResponse::text(input))
        }

        fn register_tool(&self, tool: Arc<dyn Tool>) -> AgentResult<()> {
            self.tools.lock().unwrap().push(tool.name().to_string());
            Ok(())
        }

        fn tool_count(&self) -> usize {
            self.tools.lock().unwrap().len()
        }
    }

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }

        async fn call(&self, input: serde_json::Value) -> ToolResult<serde_json::Value> {
            Ok(input)
        }
    }

    fn handle(delay: Duration) -> AgentHandle {
        AgentHandle::new(
            AgentId::new_unchecked("echo"),
            Arc::new(EchoAgent {
                tools: Mutex::new(Vec::new()),
                delay,
            }),
        )
    }

    #[tokio::test]
    async fn test_invoke_tracks_state() {
        let handle = Arc::new(handle(Duration::from_millis(50)));
        assert_eq!(handle.state(), AgentState::Idle);

        let h = handle.clone();
        let task = tokio::spawn(async move {
            let session = SessionId::new("s1").unwrap();
            h.invoke(&session, "hello").await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), AgentState::Busy);

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(handle.state(), AgentState::Idle);
        assert_eq!(handle.invocation_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_invoke_clears_busy() {
        let handle = handle(Duration::from_secs(10));
        let session = SessionId::new("s1").unwrap();
        let result =
            tokio::time::timeout(Duration::from_millis(10), handle.invoke(&session, "x")).await;
        assert!(result.is_err());
        assert_eq!(handle.state(), AgentState::Idle);
    }

    #[test]
    fn test_register_tool_records_name() {
        let handle = handle(Duration::ZERO);
        handle
            .register_tool(Arc::new(NamedTool("publish_message")))
            .unwrap();
        assert!(handle.has_tool("publish_message"));
        assert_eq!(handle.tool_count(), 1);

        let err = handle
            .register_tool(Arc::new(NamedTool("publish_message")))
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolAlreadyRegistered(_)));
    }

    #[test]
    fn test_tools_used_dedupes() {
        let exec = |name: &str| ToolExecution {
            tool_name: name.to_string(),
            input: serde_json::Value::Null,
            output: None,
            error: None,
        };
        let response = ChatResponse {
            tool_executions: vec![exec("a"), exec("b"), exec("a")],
            ..Default::default()
        };
        assert_eq!(response.tools_used(), vec!["a", "b"]);
    }
}
