//! Communication tools injected into registered agents. The restart tool
//! only goes to agents taking part in an iterative pattern with restarts.
//!
//! Each tool is bound to the agent it was registered with. Calls made while
//! the agent takes part in a run are attributed to that run through the
//! [`RunDirectory`]: published messages carry a `run_id` metadata entry,
//! workflow-scoped memory defaults to the run, and restart signals go to
//! the run's restart topic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::{AgentId, Tool, ToolError, ToolResult, Topic, TopicPattern};
use weft_memory::{MemoryError, Namespace, Query, SharedKey, SharedMemoryStore, WriteOptions};
use weft_mesh::{Delivery, MessageBus, OutgoingMessage, PublishReceipt, Subscription, SubscriptionFilter};

use crate::telemetry::Telemetry;

pub const PUBLISH_MESSAGE: &str = "publish_message";
pub const RECEIVE_MESSAGES: &str = "receive_messages";
pub const SHARED_MEMORY_WRITE: &str = "shared_memory_write";
pub const SHARED_MEMORY_READ: &str = "shared_memory_read";
pub const PUBLISH_RESTART: &str = "publish_restart";

/// Metadata key carrying the run id on bus messages.
pub const RUN_ID_METADATA: &str = "run_id";
/// Metadata key distinguishing restart signals from other control traffic.
pub const KIND_METADATA: &str = "kind";
pub(crate) const KIND_RESTART: &str = "restart";
pub(crate) const KIND_ITERATION_COMPLETED: &str = "iteration_completed";
pub(crate) const KIND_RESTART_RESPONSE: &str = "restart_response";
/// Message type of control messages; travels by value.
pub(crate) const CONTROL_MESSAGE_TYPE: &str = "control";

const DEFAULT_RECEIVE_MAX: usize = 10;

/// Request to start another iteration of an iterative run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSignal {
    pub run_id: String,
    pub requested_by: AgentId,
    /// Agent id of the pipeline stage to resume from; `None` restarts from
    /// the first stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<AgentId>,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Answer to a [`RestartSignal`], published on
/// [`restart_response_topic`] of the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartResponse {
    pub run_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<AgentId>,
    /// Why the signal was rejected; empty when accepted.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Iteration the restart starts, when accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_iteration: Option<u32>,
}

/// `workflow.restart.response.<requester>`
pub fn restart_response_topic(requester: &AgentId) -> Topic {
    Topic::new_unchecked(format!("workflow.restart.response.{requester}"))
}

// ============================================================================
// Run directory
// ============================================================================

/// The bus channel every participant of a run is subscribed to while the
/// run lasts.
pub fn run_channel(run_id: &str) -> Topic {
    Topic::new_unchecked(format!("run.{run_id}"))
}

/// Live state of one run, as seen by the injected tools.
pub(crate) struct RunBinding {
    pub run_id: String,
    pub agents: BTreeSet<AgentId>,
    pub restart_topic: Option<Topic>,
    /// Cancelled with the run; tool calls waiting on the bus give up.
    pub cancel: CancellationToken,
    started: u64,
    /// Keyed by `(agent, topic pattern)`.
    subscriptions: DashMap<(AgentId, String), Arc<Mutex<Subscription>>>,
}

impl RunBinding {
    fn subscription(
        &self,
        bus: &MessageBus,
        agent: &AgentId,
        pattern: &str,
    ) -> ToolResult<Arc<Mutex<Subscription>>> {
        let key = (agent.clone(), pattern.to_string());
        if let Some(existing) = self.subscriptions.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }
        let topic_pattern =
            TopicPattern::parse(pattern).map_err(|e| ToolError::InvalidInput(e.to_string()))?;
        let subscription = bus
            .subscribe(topic_pattern, agent.clone())
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(Arc::clone(
            self.subscriptions
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(subscription)))
                .value(),
        ))
    }
}

/// Runs currently in progress, so tools can find the run their agent is in.
#[derive(Default)]
pub(crate) struct RunDirectory {
    runs: DashMap<String, Arc<RunBinding>>,
    sequence: AtomicU64,
}

/// Unregisters its run on drop, which drops the run's subscriptions.
pub(crate) struct RunGuard {
    directory: Arc<RunDirectory>,
    run_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.directory.runs.remove(&self.run_id).is_some() {
            debug!(run_id = %self.run_id, "Run unregistered");
        }
    }
}

impl RunDirectory {
    /// Register a run and subscribe each participant to its run channel.
    pub(crate) fn register(
        self: &Arc<Self>,
        bus: &MessageBus,
        run_id: &str,
        agents: BTreeSet<AgentId>,
        restart_topic: Option<Topic>,
        cancel: CancellationToken,
    ) -> RunGuard {
        let binding = Arc::new(RunBinding {
            run_id: run_id.to_string(),
            agents,
            restart_topic,
            cancel,
            started: self.sequence.fetch_add(1, Ordering::Relaxed),
            subscriptions: DashMap::new(),
        });
        let channel = run_channel(run_id);
        for agent in &binding.agents {
            if let Err(e) = binding.subscription(bus, agent, channel.as_str()) {
                warn!(run_id, agent = %agent, error = %e, "Failed to subscribe agent to run channel");
            }
        }
        self.runs.insert(run_id.to_string(), binding);
        RunGuard {
            directory: Arc::clone(self),
            run_id: run_id.to_string(),
        }
    }

    pub(crate) fn get(&self, run_id: &str) -> Option<Arc<RunBinding>> {
        self.runs.get(run_id).map(|r| Arc::clone(r.value()))
    }

    /// Most recently started run the agent takes part in.
    pub(crate) fn active_run(&self, agent: &AgentId) -> Option<Arc<RunBinding>> {
        self.runs
            .iter()
            .filter(|r| r.agents.contains(agent))
            .max_by_key(|r| r.started)
            .map(|r| Arc::clone(r.value()))
    }

    /// Explicit run id if given, else the agent's active run.
    fn resolve(&self, agent: &AgentId, run_id: Option<&str>) -> Option<Arc<RunBinding>> {
        match run_id {
            Some(id) => self.get(id),
            None => self.active_run(agent),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.runs.len()
    }
}

// ============================================================================
// Tool context
// ============================================================================

/// Shared substrate handed to every injected tool.
pub(crate) struct ToolContext {
    pub bus: Arc<MessageBus>,
    pub shared: Arc<SharedMemoryStore>,
    pub runs: Arc<RunDirectory>,
    pub telemetry: Telemetry,
}

/// Messaging and shared memory tools for `agent`.
pub(crate) fn communication_tools(agent: &AgentId, ctx: &Arc<ToolContext>) -> Vec<Arc<dyn Tool>> {
    let bound = || Bound {
        agent: agent.clone(),
        ctx: Arc::clone(ctx),
    };
    vec![
        Arc::new(PublishMessageTool(bound())),
        Arc::new(ReceiveMessagesTool(bound())),
        Arc::new(SharedMemoryWriteTool(bound())),
        Arc::new(SharedMemoryReadTool(bound())),
    ]
}

/// The restart tool for an agent of an iterative pattern.
pub(crate) fn restart_tool(agent: &AgentId, ctx: &Arc<ToolContext>) -> Arc<dyn Tool> {
    Arc::new(PublishRestartTool(Bound {
        agent: agent.clone(),
        ctx: Arc::clone(ctx),
    }))
}

struct Bound {
    agent: AgentId,
    ctx: Arc<ToolContext>,
}

fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> ToolResult<T> {
    Ok(serde_json::from_value(input)?)
}

fn memory_error(err: MemoryError) -> ToolError {
    match err {
        MemoryError::EntryNotFound(key) | MemoryError::EntryExpired(key) => ToolError::NotFound(key),
        other => ToolError::ExecutionFailed(other.to_string()),
    }
}

/// Payload bytes for a JSON tool argument: strings travel raw, everything
/// else as JSON.
fn value_bytes(value: &Value) -> ToolResult<Vec<u8>> {
    Ok(match value {
        Value::String(s) => s.as_bytes().to_vec(),
        other => serde_json::to_vec(other)?,
    })
}

/// Publish on behalf of a tool call, abandoning the wait if the run the call
/// belongs to is cancelled.
async fn publish_in_run(
    ctx: &ToolContext,
    run: Option<&RunBinding>,
    topic: &Topic,
    message: OutgoingMessage,
) -> ToolResult<PublishReceipt> {
    let publish = ctx.bus.publish(topic, message);
    let published = match run {
        Some(run) => tokio::select! {
            biased;
            _ = run.cancel.cancelled() => {
                return Err(ToolError::ExecutionFailed(format!("run {} was cancelled", run.run_id)));
            }
            published = publish => published,
        },
        None => publish.await,
    };
    let receipt = published.map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    ctx.telemetry.published(&receipt);
    Ok(receipt)
}

/// Inverse of [`value_bytes`]: JSON when it parses, text otherwise.
fn bytes_value(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// ============================================================================
// publish_message
// ============================================================================

#[derive(Debug, Deserialize)]
struct PublishInput {
    topic: String,
    message: Value,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    run_id: Option<String>,
}

struct PublishMessageTool(Bound);

#[async_trait]
impl Tool for PublishMessageTool {
    fn name(&self) -> &str {
        PUBLISH_MESSAGE
    }

    fn description(&self) -> &str {
        "Publish a message on a bus topic for other agents to receive"
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "topic": {"type": "string"},
                "message": {},
                "message_type": {"type": "string"},
                "metadata": {"type": "object", "additionalProperties": {"type": "string"}},
                "run_id": {"type": "string"}
            },
            "required": ["topic", "message"]
        }))
    }

    async fn call(&self, input: Value) -> ToolResult<Value> {
        let input: PublishInput = parse_input(input)?;
        let Bound { agent, ctx } = &self.0;
        let topic = Topic::parse(&input.topic).map_err(|e| ToolError::InvalidInput(e.to_string()))?;

        let mut message = OutgoingMessage::new(value_bytes(&input.message)?).from_agent(agent.clone());
        if let Some(message_type) = input.message_type {
            message = message.with_type(message_type);
        } else if !input.message.is_string() {
            message = message.with_type("json");
        }
        for (key, value) in input.metadata {
            message = message.with_metadata(key, value);
        }
        let run = ctx.runs.resolve(agent, input.run_id.as_deref());
        if let Some(run) = &run {
            message = message.with_metadata(RUN_ID_METADATA, run.run_id.clone());
        }

        let receipt = publish_in_run(ctx, run.as_deref(), &topic, message).await?;
        debug!(agent = %agent, topic = %topic, delivered = receipt.delivered, "Agent published message");

        Ok(json!({
            "message_id": receipt.message_id.as_str(),
            "sequence": receipt.sequence,
            "delivered": receipt.delivered,
            "dropped": receipt.dropped,
        }))
    }
}

// ============================================================================
// receive_messages
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReceiveInput {
    /// Defaults to the run channel.
    #[serde(default)]
    topic_pattern: Option<String>,
    #[serde(default)]
    max: Option<usize>,
    /// Wait this long for a first message when none is queued.
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    run_id: Option<String>,
}

struct ReceiveMessagesTool(Bound);

fn delivery_json(delivery: &Delivery) -> Value {
    let message = delivery.message();
    let payload = match delivery.payload() {
        Ok(bytes) => bytes_value(&bytes),
        Err(e) => json!({"error": e.to_string()}),
    };
    json!({
        "id": message.id.as_str(),
        "topic": message.topic.as_str(),
        "from": message.from.as_ref().map(AgentId::as_str),
        "sequence": message.sequence,
        "message_type": message.message_type,
        "metadata": message.metadata,
        "payload": payload,
    })
}

#[async_trait]
impl Tool for ReceiveMessagesTool {
    fn name(&self) -> &str {
        RECEIVE_MESSAGES
    }

    fn description(&self) -> &str {
        "Receive messages published on topics this agent listens to during the current run"
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "topic_pattern": {"type": "string"},
                "max": {"type": "integer", "minimum": 1},
                "timeout_ms": {"type": "integer", "minimum": 0},
                "run_id": {"type": "string"}
            }
        }))
    }

    async fn call(&self, input: Value) -> ToolResult<Value> {
        let input: ReceiveInput = parse_input(input)?;
        let Bound { agent, ctx } = &self.0;
        let run = ctx
            .runs
            .resolve(agent, input.run_id.as_deref())
            .ok_or_else(|| ToolError::NotFound(format!("no active run for agent {agent}")))?;
        let pattern = input
            .topic_pattern
            .unwrap_or_else(|| run_channel(&run.run_id).to_string());
        let subscription = run.subscription(&ctx.bus, agent, &pattern)?;
        let max = input.max.unwrap_or(DEFAULT_RECEIVE_MAX).max(1);

        let mut subscription = subscription.lock().await;
        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            match subscription.try_recv() {
                Some(delivery) => deliveries.push(delivery),
                None => break,
            }
        }
        if deliveries.is_empty()
            && let Some(timeout) = input.timeout_ms
            && let Some(delivery) = subscription.recv_timeout(Duration::from_millis(timeout)).await
        {
            deliveries.push(delivery);
        }
        drop(subscription);

        let messages: Vec<Value> = deliveries
            .into_iter()
            .map(|delivery| {
                let value = delivery_json(&delivery);
                delivery.ack();
                value
            })
            .collect();
        Ok(json!({ "count": messages.len(), "messages": messages }))
    }
}

// ============================================================================
// shared memory
// ============================================================================

#[derive(Debug, Deserialize)]
struct MemoryLocation {
    key: String,
    #[serde(default)]
    namespace: Option<Namespace>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
}

impl MemoryLocation {
    /// Resolve to a full key. Run-scoped namespaces default their scope to
    /// the agent's run; the agent namespace is always the caller's own.
    fn resolve(&self, agent: &AgentId, runs: &RunDirectory) -> ToolResult<SharedKey> {
        let namespace = self.namespace.unwrap_or(Namespace::Workflow);
        let scope = match namespace {
            Namespace::Global => String::new(),
            Namespace::Agent => self.scope.clone().unwrap_or_else(|| agent.to_string()),
            Namespace::Session => self
                .scope
                .clone()
                .ok_or_else(|| ToolError::InvalidInput("session namespace requires a scope".to_string()))?,
            Namespace::Workflow | Namespace::Swarm | Namespace::Debate => match &self.scope {
                Some(scope) => scope.clone(),
                None => runs
                    .resolve(agent, self.run_id.as_deref())
                    .map(|run| run.run_id.clone())
                    .ok_or_else(|| {
                        ToolError::InvalidInput(format!(
                            "{namespace} namespace needs a scope outside of a run"
                        ))
                    })?,
            },
        };
        Ok(SharedKey::new(namespace, scope, self.key.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct WriteInput {
    #[serde(flatten)]
    location: MemoryLocation,
    value: Value,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    expected_version: Option<u64>,
}

struct SharedMemoryWriteTool(Bound);

#[async_trait]
impl Tool for SharedMemoryWriteTool {
    fn name(&self) -> &str {
        SHARED_MEMORY_WRITE
    }

    fn description(&self) -> &str {
        "Store a value in shared memory, scoped to the current workflow run by default"
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "value": {},
                "namespace": {"enum": ["global", "workflow", "swarm", "debate", "session", "agent"]},
                "scope": {"type": "string"},
                "ttl_seconds": {"type": "integer", "minimum": 1},
                "expected_version": {"type": "integer", "minimum": 0}
            },
            "required": ["key", "value"]
        }))
    }

    async fn call(&self, input: Value) -> ToolResult<Value> {
        let input: WriteInput = parse_input(input)?;
        let Bound { agent, ctx } = &self.0;
        let key = input.location.resolve(agent, &ctx.runs)?;
        let options = WriteOptions {
            owner: Some(agent.clone()),
            ttl: input.ttl_seconds.map(Duration::from_secs),
            expected_version: input.expected_version,
        };
        let entry = ctx
            .shared
            .put(key, value_bytes(&input.value)?, options)
            .await
            .map_err(memory_error)?;
        debug!(agent = %agent, key = %entry.key, version = entry.version, "Agent wrote shared memory");
        Ok(json!({
            "key": entry.key.to_string(),
            "version": entry.version,
            "size_bytes": entry.size_bytes,
            "compressed": entry.compressed,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ReadInput {
    #[serde(flatten)]
    location: MemoryLocation,
    #[serde(default)]
    query: Option<Query>,
}

struct SharedMemoryReadTool(Bound);

#[async_trait]
impl Tool for SharedMemoryReadTool {
    fn name(&self) -> &str {
        SHARED_MEMORY_READ
    }

    fn description(&self) -> &str {
        "Read a shared memory value, optionally running a top_n or group_by query over it"
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "namespace": {"enum": ["global", "workflow", "swarm", "debate", "session", "agent"]},
                "scope": {"type": "string"},
                "query": {"type": "object"}
            },
            "required": ["key"]
        }))
    }

    async fn call(&self, input: Value) -> ToolResult<Value> {
        let input: ReadInput = parse_input(input)?;
        let Bound { agent, ctx } = &self.0;
        let key = input.location.resolve(agent, &ctx.runs)?;

        if let Some(query) = input.query {
            key.check_access(agent).map_err(memory_error)?;
            let rows = ctx.shared.query(&key, &query).await.map_err(memory_error)?;
            return Ok(json!({ "key": key.to_string(), "result": rows }));
        }

        let value = ctx.shared.get_as(&key, agent).await.map_err(memory_error)?;
        Ok(json!({
            "key": key.to_string(),
            "version": value.entry.version,
            "value": bytes_value(&value.payload),
        }))
    }
}

// ============================================================================
// publish_restart
// ============================================================================

#[derive(Debug, Deserialize)]
struct RestartInput {
    reason: String,
    #[serde(default)]
    target_stage: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
}

struct PublishRestartTool(Bound);

#[async_trait]
impl Tool for PublishRestartTool {
    fn name(&self) -> &str {
        PUBLISH_RESTART
    }

    fn description(&self) -> &str {
        "Ask the running iterative workflow to start another iteration, optionally from a given stage"
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string"},
                "target_stage": {"type": "string", "description": "agent id of the stage to resume from"},
                "run_id": {"type": "string"}
            },
            "required": ["reason"]
        }))
    }

    async fn call(&self, input: Value) -> ToolResult<Value> {
        let input: RestartInput = parse_input(input)?;
        let Bound { agent, ctx } = &self.0;
        let run = ctx
            .runs
            .resolve(agent, input.run_id.as_deref())
            .ok_or_else(|| ToolError::NotFound(format!("no active run for agent {agent}")))?;
        let topic = run.restart_topic.clone().ok_or_else(|| {
            ToolError::ExecutionFailed(format!("run {} does not accept restarts", run.run_id))
        })?;
        let target_stage = input
            .target_stage
            .map(AgentId::parse)
            .transpose()
            .map_err(|e| ToolError::InvalidInput(e.to_string()))?;

        let signal = RestartSignal {
            run_id: run.run_id.clone(),
            requested_by: agent.clone(),
            target_stage,
            reason: input.reason,
            requested_at: Utc::now(),
        };
        let message = OutgoingMessage::json(&signal)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            .with_type(CONTROL_MESSAGE_TYPE)
            .from_agent(agent.clone())
            .with_metadata(KIND_METADATA, KIND_RESTART)
            .with_metadata(RUN_ID_METADATA, run.run_id.clone());
        let receipt = publish_in_run(ctx, Some(&*run), &topic, message).await?;
        debug!(agent = %agent, run_id = %run.run_id, topic = %topic, "Restart requested");

        Ok(json!({
            "message_id": receipt.message_id.as_str(),
            "run_id": run.run_id,
            "delivered": receipt.delivered,
        }))
    }
}

/// Filter selecting restart signals of one run.
pub(crate) fn restart_filter(run_id: &str) -> SubscriptionFilter {
    SubscriptionFilter::default()
        .with_metadata(KIND_METADATA, KIND_RESTART)
        .with_metadata(RUN_ID_METADATA, run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{BusConfig, CommunicationConfig, SharedMemoryConfig};
    use weft_memory::ReferenceStore;

    fn context() -> Arc<ToolContext> {
        let store = Arc::new(ReferenceStore::new(CommunicationConfig::default()));
        let mut shared_config = SharedMemoryConfig::default();
        shared_config.overflow.enabled = false;
        Arc::new(ToolContext {
            bus: Arc::new(MessageBus::new(BusConfig::default(), store).unwrap()),
            shared: Arc::new(SharedMemoryStore::new(shared_config)),
            runs: Arc::new(RunDirectory::default()),
            telemetry: Telemetry::default(),
        })
    }

    fn tool(ctx: &Arc<ToolContext>, agent: &str, name: &str) -> Arc<dyn Tool> {
        let agent = AgentId::new_unchecked(agent);
        if name == PUBLISH_RESTART {
            return restart_tool(&agent, ctx);
        }
        communication_tools(&agent, ctx)
            .into_iter()
            .find(|t| t.name() == name)
            .unwrap()
    }

    fn agents(ids: &[&str]) -> BTreeSet<AgentId> {
        ids.iter().map(|a| AgentId::new_unchecked(*a)).collect()
    }

    #[tokio::test]
    async fn test_run_channel_roundtrip() {
        let ctx = context();
        let _guard = ctx.runs.register(&ctx.bus, "run-1", agents(&["a", "b"]), None, CancellationToken::new());

        let published = tool(&ctx, "a", PUBLISH_MESSAGE)
            .call(json!({"topic": "run.run-1", "message": {"finding": 42}}))
            .await
            .unwrap();
        assert_eq!(published["delivered"], 2);

        let received = tool(&ctx, "b", RECEIVE_MESSAGES).call(json!({})).await.unwrap();
        assert_eq!(received["count"], 1);
        let message = &received["messages"][0];
        assert_eq!(message["from"], "a");
        assert_eq!(message["payload"]["finding"], 42);
        assert_eq!(message["metadata"]["run_id"], "run-1");
    }

    #[tokio::test]
    async fn test_subscriptions_end_with_the_run() {
        let ctx = context();
        let guard = ctx.runs.register(&ctx.bus, "run-2", agents(&["a"]), None, CancellationToken::new());
        assert_eq!(ctx.bus.subscription_count(), 1);
        drop(guard);
        assert_eq!(ctx.runs.len(), 0);
        assert_eq!(ctx.bus.subscription_count(), 0);

        let err = tool(&ctx, "a", RECEIVE_MESSAGES).call(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_shared_memory_defaults_to_run_scope() {
        let ctx = context();
        let _guard = ctx.runs.register(&ctx.bus, "run-3", agents(&["a", "b"]), None, CancellationToken::new());

        tool(&ctx, "a", SHARED_MEMORY_WRITE)
            .call(json!({"key": "rows", "value": [{"k": "x", "v": 1}, {"k": "y", "v": 3}]}))
            .await
            .unwrap();
        let read = tool(&ctx, "b", SHARED_MEMORY_READ)
            .call(json!({"key": "rows"}))
            .await
            .unwrap();
        assert_eq!(read["key"], "workflow:run-3:rows");
        assert_eq!(read["value"][1]["v"], 3);

        let top = tool(&ctx, "b", SHARED_MEMORY_READ)
            .call(json!({"key": "rows", "query": {"type": "top_n", "n": 1, "sort_by": "v"}}))
            .await
            .unwrap();
        assert_eq!(top["result"][0]["k"], "y");

        let missing = tool(&ctx, "b", SHARED_MEMORY_READ)
            .call(json!({"key": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(missing, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_agent_namespace_is_private() {
        let ctx = context();
        tool(&ctx, "a", SHARED_MEMORY_WRITE)
            .call(json!({"key": "notes", "value": "mine", "namespace": "agent"}))
            .await
            .unwrap();
        let own = tool(&ctx, "a", SHARED_MEMORY_READ)
            .call(json!({"key": "notes", "namespace": "agent"}))
            .await
            .unwrap();
        assert_eq!(own["value"], "mine");

        let err = tool(&ctx, "b", SHARED_MEMORY_READ)
            .call(json!({"key": "notes", "namespace": "agent", "scope": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_restart_signal_reaches_filtered_subscriber() {
        let ctx = context();
        let topic = Topic::new_unchecked("workflow.restart");
        let _guard = ctx
            .runs
            .register(
                &ctx.bus,
                "run-4",
                agents(&["critic"]),
                Some(topic.clone()),
                CancellationToken::new(),
            );
        let mut listener = ctx
            .bus
            .subscribe_with(
                TopicPattern::exact(&topic),
                AgentId::new_unchecked("executor"),
                restart_filter("run-4"),
            )
            .unwrap();

        tool(&ctx, "critic", PUBLISH_RESTART)
            .call(json!({"reason": "draft misses sources", "target_stage": "writer"}))
            .await
            .unwrap();

        let delivery = listener.try_recv().unwrap();
        let signal: RestartSignal = delivery.json().unwrap();
        assert_eq!(signal.run_id, "run-4");
        assert_eq!(signal.requested_by.as_str(), "critic");
        assert_eq!(signal.target_stage.unwrap().as_str(), "writer");
        delivery.ack();
    }

    #[tokio::test]
    async fn test_restart_outside_iterative_run_fails() {
        let ctx = context();
        let _guard = ctx.runs.register(&ctx.bus, "run-5", agents(&["a"]), None, CancellationToken::new());
        let err = tool(&ctx, "a", PUBLISH_RESTART)
            .call(json!({"reason": "again"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[test]
    fn test_restart_tool_is_separate() {
        let ctx = context();
        let agent = AgentId::new_unchecked("a");
        let names: Vec<String> = communication_tools(&agent, &ctx)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(
            names,
            [PUBLISH_MESSAGE, RECEIVE_MESSAGES, SHARED_MEMORY_WRITE, SHARED_MEMORY_READ]
        );
        assert_eq!(restart_tool(&agent, &ctx).name(), PUBLISH_RESTART);
    }

    #[tokio::test]
    async fn test_publish_gives_up_when_run_is_cancelled() {
        let store = Arc::new(ReferenceStore::new(CommunicationConfig::default()));
        let bus_config = BusConfig {
            buffer_size: 1,
            non_critical: weft_core::TopicClassPolicy {
                send_timeout: Duration::from_secs(5),
            },
            ..BusConfig::default()
        };
        let mut shared_config = SharedMemoryConfig::default();
        shared_config.overflow.enabled = false;
        let ctx = Arc::new(ToolContext {
            bus: Arc::new(MessageBus::new(bus_config, store).unwrap()),
            shared: Arc::new(SharedMemoryStore::new(shared_config)),
            runs: Arc::new(RunDirectory::default()),
            telemetry: Telemetry::default(),
        });
        let cancel = CancellationToken::new();
        let _guard = ctx
            .runs
            .register(&ctx.bus, "run-6", agents(&["a", "b"]), None, cancel.clone());
        let publish = tool(&ctx, "a", PUBLISH_MESSAGE);

        // fills b's queue; the next publish waits for room
        publish
            .call(json!({"topic": "run.run-6", "message": "first"}))
            .await
            .unwrap();
        let blocked = tokio::spawn(async move {
            publish
                .call(json!({"topic": "run.run-6", "message": "second"}))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(m) if m.contains("cancelled")));
    }
}
