//! The orchestrator facade.
//!
//! [`Orchestrator`] owns the substrate (reference store, message bus,
//! shared memory), the agent registry and the concurrency limiter, and
//! hands them to a [`PatternExecutor`] for every run. Agents registered
//! here get the communication tools injected unless
//! `orchestrator.tool_injection` is off; the restart tool is added when an
//! agent is first run inside an iterative pattern that accepts restarts.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use weft_core::{Agent, AgentHandle, AgentId, ConfigError, Judge, WeftConfig};
use weft_memory::{GcReport, ReferenceStore, SharedMemoryStore, SweeperHandle};
use weft_mesh::MessageBus;

#[cfg(feature = "metrics")]
use weft_observability::WorkflowMetrics;

use crate::agreement::{AgreementCheck, JaccardAgreement};
use crate::error::{OrchResult, OrchestrationError};
use crate::executor::{PatternExecutor, RunOptions};
use crate::library::{PatternLibrary, PatternUpdateEvent};
use crate::limiter::ConcurrencyLimiter;
use crate::merge::Reducer;
use crate::pattern::{PatternTable, WorkflowPattern};
use crate::progress::{ProgressEvent, ProgressFeed};
use crate::result::WorkflowResult;
use crate::telemetry::Telemetry;
use crate::tools::{PUBLISH_RESTART, RunDirectory, ToolContext, communication_tools, restart_tool};
use crate::workflow::WorkflowDocument;

pub struct Orchestrator {
    config: WeftConfig,
    executor: PatternExecutor,
    store: Arc<ReferenceStore>,
    tools: Arc<ToolContext>,
    library: Arc<PatternLibrary>,
    sweepers: Mutex<Vec<SweeperHandle>>,
}

impl Orchestrator {
    /// Build an orchestrator and its substrate from a validated config.
    pub fn new(config: WeftConfig) -> OrchResult<Self> {
        config.validate()?;

        let store = Arc::new(ReferenceStore::new(config.communication.clone()));
        let bus = MessageBus::new(config.bus.clone(), Arc::clone(&store)).map_err(|e| {
            ConfigError::Invalid {
                field: "bus".to_string(),
                reason: e.to_string(),
            }
        })?;
        let bus = Arc::new(bus);
        let shared = Arc::new(SharedMemoryStore::new(config.shared_memory.clone()));
        let runs = Arc::new(RunDirectory::default());
        let telemetry = Telemetry::default();

        let tools = Arc::new(ToolContext {
            bus: Arc::clone(&bus),
            shared: Arc::clone(&shared),
            runs: Arc::clone(&runs),
            telemetry: telemetry.clone(),
        });
        let executor = PatternExecutor {
            agents: Arc::new(DashMap::new()),
            limiter: ConcurrencyLimiter::new(config.orchestrator.max_concurrent_invocations),
            bus,
            shared,
            runs,
            reducers: Arc::new(DashMap::new()),
            agreement: Arc::new(JaccardAgreement::default()),
            judge: None,
            synthesizer: None,
            progress: ProgressFeed::new(config.orchestrator.progress_buffer),
            config: config.orchestrator.clone(),
            telemetry,
        };

        info!(
            max_concurrent_invocations = config.orchestrator.max_concurrent_invocations,
            tool_injection = config.orchestrator.tool_injection,
            "Orchestrator created"
        );
        Ok(Self {
            config,
            executor,
            store,
            tools,
            library: Arc::new(PatternLibrary::default()),
            sweepers: Mutex::new(Vec::new()),
        })
    }

    /// Judge used by judged conditional branches.
    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.executor.judge = Some(judge);
        self
    }

    /// Replace the debate agreement measure.
    pub fn with_agreement(mut self, agreement: Arc<dyn AgreementCheck>) -> Self {
        self.executor.agreement = agreement;
        self
    }

    /// Default synthesizer for LLM-backed merges.
    pub fn with_synthesizer(mut self, agent: AgentId) -> Self {
        self.executor.synthesizer = Some(agent);
        self
    }

    /// Record runs, invocations, bus traffic and GC into `metrics`. Must be
    /// called before agents are registered for their tools to report too.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<WorkflowMetrics>) -> Self {
        let telemetry = Telemetry::with_metrics(metrics);
        self.tools = Arc::new(ToolContext {
            bus: Arc::clone(&self.tools.bus),
            shared: Arc::clone(&self.tools.shared),
            runs: Arc::clone(&self.tools.runs),
            telemetry: telemetry.clone(),
        });
        self.executor.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &WeftConfig {
        &self.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an agent, replacing any agent with the same id. Tool
    /// injection failures are logged and do not fail registration.
    pub fn register_agent(&self, id: AgentId, agent: Arc<dyn Agent>) -> Arc<AgentHandle> {
        let handle = Arc::new(AgentHandle::new(id.clone(), agent));
        if self.config.orchestrator.tool_injection {
            for tool in communication_tools(&id, &self.tools) {
                let name = tool.name().to_string();
                if let Err(e) = handle.register_tool(tool) {
                    warn!(agent = %id, tool = %name, error = %e, "Failed to inject tool");
                }
            }
        }
        if self.executor.agents.insert(id.clone(), Arc::clone(&handle)).is_some() {
            info!(agent = %id, "Agent replaced");
        } else {
            debug!(agent = %id, tools = handle.tool_count(), "Agent registered");
        }
        handle
    }

    pub fn unregister_agent(&self, id: &AgentId) -> Option<Arc<AgentHandle>> {
        self.executor.agents.remove(id).map(|(_, handle)| handle)
    }

    pub fn agent(&self, id: &AgentId) -> Option<Arc<AgentHandle>> {
        self.executor.agents.get(id).map(|h| Arc::clone(h.value()))
    }

    /// Registered agent ids, sorted.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.executor.agents.iter().map(|h| h.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Give the restart tool to every agent reachable from a restartable
    /// iterative pattern of `table`.
    fn inject_restart_tools(&self, table: &PatternTable) {
        if !self.config.orchestrator.tool_injection {
            return;
        }
        for pattern in table.reachable() {
            let WorkflowPattern::Iterative(iterative) = pattern else {
                continue;
            };
            if !iterative.restart.enabled {
                continue;
            }
            for agent in table.agents_reachable(iterative.base) {
                let Some(handle) = self.agent(&agent) else {
                    continue;
                };
                if handle.has_tool(PUBLISH_RESTART) {
                    continue;
                }
                match handle.register_tool(restart_tool(&agent, &self.tools)) {
                    Ok(()) => debug!(agent = %agent, "Restart tool injected"),
                    Err(e) => warn!(agent = %agent, error = %e, "Failed to inject restart tool"),
                }
            }
        }
    }

    /// Register a reducer selectable as `custom:<name>`.
    pub fn register_reducer(&self, name: impl Into<String>, reducer: Arc<dyn Reducer>) {
        self.executor.reducers.insert(name.into(), reducer);
    }

    // ========================================================================
    // Execution
    // ========================================================================

    pub async fn execute_pattern(&self, table: &PatternTable) -> OrchResult<WorkflowResult> {
        self.execute_pattern_with(table, RunOptions::default()).await
    }

    pub async fn execute_pattern_with(
        &self,
        table: &PatternTable,
        options: RunOptions,
    ) -> OrchResult<WorkflowResult> {
        self.inject_restart_tools(table);
        self.executor.execute(table, options).await
    }

    /// Check a pattern against the registered agents, reducers and judge
    /// without running it.
    pub fn validate_pattern(&self, table: &PatternTable) -> OrchResult<()> {
        self.inject_restart_tools(table);
        self.executor.validate(table)
    }

    /// Parse a workflow document and check it against this orchestrator.
    pub fn validate_workflow(&self, text: &str) -> OrchResult<WorkflowDocument> {
        let document = WorkflowDocument::from_yaml_str(text)?;
        self.inject_restart_tools(&document.table);
        self.executor.validate(&document.table)?;
        Ok(document)
    }

    /// Run a workflow document. The document's timeout applies unless
    /// `options` sets one.
    pub async fn execute_workflow(
        &self,
        document: &WorkflowDocument,
        mut options: RunOptions,
    ) -> OrchResult<WorkflowResult> {
        if options.timeout.is_none() {
            options.timeout = document.timeout;
        }
        info!(workflow = %document.name(), spec_type = %document.spec_type, "Executing workflow");
        self.inject_restart_tools(&document.table);
        self.executor.execute(&document.table, options).await
    }

    /// Run a workflow stored in the library.
    pub async fn execute_named(&self, name: &str, options: RunOptions) -> OrchResult<WorkflowResult> {
        let document = self
            .library
            .get(name)
            .ok_or_else(|| OrchestrationError::InvalidWorkflow(format!("unknown workflow '{name}'")))?;
        self.execute_workflow(&document, options).await
    }

    // ========================================================================
    // Feeds and substrate
    // ========================================================================

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.executor.progress.subscribe()
    }

    pub fn subscribe_pattern_updates(&self) -> broadcast::Receiver<PatternUpdateEvent> {
        self.library.subscribe()
    }

    pub fn library(&self) -> &Arc<PatternLibrary> {
        &self.library
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.executor.bus
    }

    pub fn shared_memory(&self) -> &Arc<SharedMemoryStore> {
        &self.executor.shared
    }

    pub fn reference_store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    /// Invocations currently holding a permit.
    pub fn invocations_in_flight(&self) -> usize {
        self.executor.limiter.in_use()
    }

    /// Runs currently in progress.
    pub fn active_runs(&self) -> usize {
        self.executor.runs.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the reference GC and shared memory sweepers. Calling it again
    /// while they run does nothing.
    pub fn start_background(&self) {
        let mut sweepers = self.sweepers.lock().unwrap_or_else(PoisonError::into_inner);
        if sweepers.iter().any(SweeperHandle::is_running) {
            debug!("Background sweepers already running");
            return;
        }
        sweepers.clear();
        let telemetry = self.executor.telemetry.clone();
        if let Some(gc) = self.store.spawn_gc_with(move |report| telemetry.gc(report)) {
            sweepers.push(gc);
        }
        sweepers.push(self.executor.shared.spawn_sweeper());
        info!(sweepers = sweepers.len(), "Background sweepers started");
    }

    /// Run one reference GC pass now.
    pub fn sweep_references(&self) -> GcReport {
        let report = self.store.sweep();
        self.executor.telemetry.gc(&report);
        report
    }

    /// Stop the sweepers, close the bus and refuse further invocations.
    pub async fn shutdown(&self) {
        let sweepers = std::mem::take(
            &mut *self.sweepers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for sweeper in sweepers {
            sweeper.shutdown().await;
        }
        self.executor.bus.close();
        self.executor.limiter.close();
        info!("Orchestrator shut down");
    }
}
