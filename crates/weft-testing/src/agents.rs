//! Mock agents

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weft_core::{
    Agent, AgentError, AgentResult, ChatResponse, SessionId, Tool, ToolExecution, Usage,
};

/// One observed chat turn
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub session_id: SessionId,
    pub input: String,
    pub started_at: Instant,
    pub finished_at: Instant,
}

type ReplyFn = Box<dyn Fn(&str) -> String + Send + Sync>;

enum Replies {
    Fixed(String),
    /// Replies in order; the last one repeats once exhausted.
    Sequence(Mutex<VecDeque<String>>, Mutex<String>),
    Computed(ReplyFn),
}

struct ScriptedToolCall {
    /// 1-based call number, `None` for every call
    on_call: Option<usize>,
    tool: String,
    input: Value,
}

/// An agent whose replies are scripted by the test
pub struct ScriptedAgent {
    replies: Replies,
    usage: Usage,
    model: Option<String>,
    delay: Option<Duration>,
    tool_calls: Vec<ScriptedToolCall>,
    tools: Mutex<Vec<Arc<dyn Tool>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedAgent {
    fn with_replies(replies: Replies) -> Self {
        Self {
            replies,
            usage: Usage::default(),
            model: None,
            delay: None,
            tool_calls: Vec::new(),
            tools: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always reply with the same text.
    pub fn replying(reply: impl Into<String>) -> Self {
        Self::with_replies(Replies::Fixed(reply.into()))
    }

    /// Reply with each text in turn, repeating the last.
    pub fn sequence<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queue: VecDeque<String> = replies.into_iter().map(Into::into).collect();
        let last = queue.pop_back().unwrap_or_default();
        queue.push_back(last.clone());
        Self::with_replies(Replies::Sequence(Mutex::new(queue), Mutex::new(last)))
    }

    /// Compute the reply from the input.
    pub fn from_fn(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self::with_replies(Replies::Computed(Box::new(f)))
    }

    /// Report this usage on every turn.
    pub fn with_usage(mut self, cost_usd: f64, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage {
            cost_usd,
            input_tokens,
            output_tokens,
        };
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sleep before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Call a registered tool on every turn before replying.
    pub fn calling_tool(mut self, tool: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push(ScriptedToolCall {
            on_call: None,
            tool: tool.into(),
            input,
        });
        self
    }

    /// Call a registered tool on the given (1-based) turn only.
    pub fn calling_tool_on(mut self, call: usize, tool: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push(ScriptedToolCall {
            on_call: Some(call),
            tool: tool.into(),
            input,
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.input.clone())
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    fn next_reply(&self, input: &str) -> String {
        match &self.replies {
            Replies::Fixed(reply) => reply.clone(),
            Replies::Sequence(queue, last) => {
                let mut queue = queue.lock().unwrap();
                match queue.pop_front() {
                    Some(reply) => {
                        *last.lock().unwrap() = reply.clone();
                        reply
                    }
                    None => last.lock().unwrap().clone(),
                }
            }
            Replies::Computed(f) => f(input),
        }
    }

    fn find_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    async fn run_tools(&self, call_number: usize) -> Vec<ToolExecution> {
        let mut executions = Vec::new();
        for scripted in &self.tool_calls {
            if scripted.on_call.is_some_and(|n| n != call_number) {
                continue;
            }
            let execution = match self.find_tool(&scripted.tool) {
                Some(tool) => match tool.call(scripted.input.clone()).await {
                    Ok(output) => ToolExecution {
                        tool_name: scripted.tool.clone(),
                        input: scripted.input.clone(),
                        output: Some(output),
                        error: None,
                    },
                    Err(e) => ToolExecution {
                        tool_name: scripted.tool.clone(),
                        input: scripted.input.clone(),
                        output: None,
                        error: Some(e.to_string()),
                    },
                },
                None => ToolExecution {
                    tool_name: scripted.tool.clone(),
                    input: scripted.input.clone(),
                    output: None,
                    error: Some("tool not registered".to_string()),
                },
            };
            executions.push(execution);
        }
        executions
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn chat(&self, session_id: &SessionId, input: &str) -> AgentResult<ChatResponse> {
        let started_at = Instant::now();
        let call_number = self.call_count() + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let tool_executions = self.run_tools(call_number).await;
        let reply = self.next_reply(input);
        self.calls.lock().unwrap().push(RecordedCall {
            session_id: session_id.clone(),
            input: input.to_string(),
            started_at,
            finished_at: Instant::now(),
        });

        Ok(ChatResponse {
            content: reply,
            tool_executions,
            usage: self.usage.clone(),
            model: self.model.clone(),
        })
    }

    fn register_tool(&self, tool: Arc<dyn Tool>) -> AgentResult<()> {
        let mut tools = self.tools.lock().unwrap();
        if tools.iter().any(|t| t.name() == tool.name()) {
            return Err(AgentError::ToolAlreadyRegistered(tool.name().to_string()));
        }
        tools.push(tool);
        Ok(())
    }

    fn tool_count(&self) -> usize {
        self.tools.lock().unwrap().len()
    }
}

/// An agent that fails every turn
pub struct FailingAgent {
    message: String,
    accepts_tools: bool,
    calls: AtomicUsize,
}

impl FailingAgent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            accepts_tools: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Also reject every tool registration.
    pub fn without_tools(mut self) -> Self {
        self.accepts_tools = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FailingAgent {
    async fn chat(&self, _session_id: &SessionId, _input: &str) -> AgentResult<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::InvocationFailed(self.message.clone()))
    }

    fn register_tool(&self, _tool: Arc<dyn Tool>) -> AgentResult<()> {
        if self.accepts_tools {
            Ok(())
        } else {
            Err(AgentError::ToolsUnsupported)
        }
    }

    fn tool_count(&self) -> usize {
        0
    }
}

/// An agent that replies after a delay, recording how many turns overlapped
pub struct SlowAgent {
    delay: Duration,
    reply: String,
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowAgent {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            reply: "done".to_string(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = reply.into();
        self
    }

    /// Most turns ever in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Turns that ran to completion (not cancelled)
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Agent for SlowAgent {
    async fn chat(&self, _session_id: &SessionId, _input: &str) -> AgentResult<ChatResponse> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.current);
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse::text(self.reply.clone()))
    }

    fn register_tool(&self, _tool: Arc<dyn Tool>) -> AgentResult<()> {
        Ok(())
    }

    fn tool_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::ToolResult;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, input: Value) -> ToolResult<Value> {
            Ok(input)
        }
    }

    fn session() -> SessionId {
        SessionId::new("test-session").unwrap()
    }

    #[tokio::test]
    async fn test_computed_replies_and_call_log() {
        let agent = ScriptedAgent::from_fn(|input| input.to_uppercase()).with_usage(0.01, 10, 5);
        let response = agent.chat(&session(), "abc").await.unwrap();
        assert_eq!(response.content, "ABC");
        assert_eq!(response.usage.total_tokens(), 15);
        assert_eq!(agent.inputs(), vec!["abc".to_string()]);
        let call = &agent.calls()[0];
        assert!(call.finished_at >= call.started_at);
    }

    #[tokio::test]
    async fn test_scripted_tool_calls() {
        let agent = ScriptedAgent::replying("ok")
            .calling_tool_on(2, "echo", serde_json::json!({"n": 2}))
            .calling_tool("missing", Value::Null);
        agent.register_tool(Arc::new(Echo)).unwrap();
        assert!(matches!(
            agent.register_tool(Arc::new(Echo)),
            Err(AgentError::ToolAlreadyRegistered(_))
        ));

        let first = agent.chat(&session(), "1").await.unwrap();
        assert_eq!(first.tool_executions.len(), 1);
        assert!(!first.tool_executions[0].succeeded());

        let second = agent.chat(&session(), "2").await.unwrap();
        assert_eq!(second.tools_used(), vec!["echo".to_string(), "missing".to_string()]);
        assert_eq!(
            second.tool_executions[0].output,
            Some(serde_json::json!({"n": 2}))
        );
    }

    #[tokio::test]
    async fn test_failing_agent() {
        let agent = FailingAgent::new("boom").without_tools();
        assert!(agent.chat(&session(), "x").await.is_err());
        assert!(agent.register_tool(Arc::new(Echo)).is_err());
        assert_eq!(agent.call_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_agent_tracks_overlap() {
        let agent = Arc::new(SlowAgent::new(Duration::from_millis(20)));
        let s = session();
        let (a, b) = tokio::join!(agent.chat(&s, "a"), agent.chat(&s, "b"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(agent.peak_concurrency(), 2);
        assert_eq!(agent.completed(), 2);
        assert_eq!(agent.in_flight(), 0);
    }
}
