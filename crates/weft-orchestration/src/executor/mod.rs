//! Pattern execution.
//!
//! A [`PatternExecutor`] owns nothing per run. Each call to
//! [`PatternExecutor::execute`] validates the pattern table, opens a
//! [`Run`] (run id, cost ledger, cancellation token, run directory entry)
//! and walks the table from its root. Nested patterns recurse through
//! [`Run::execute_pattern`].

mod conditional;
mod debate;
mod fork_join;
mod iterative;
mod parallel;
mod pipeline;

pub use pipeline::stage_output_key;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::{AgentHandle, AgentId, Judge, OrchestratorConfig, SessionId};
use weft_memory::SharedMemoryStore;
use weft_mesh::MessageBus;

use crate::agreement::AgreementCheck;
use crate::cost::CostSummary;
use crate::error::{OrchResult, OrchestrationError, Step};
use crate::merge::{MergeStrategy, Reducer, concatenate};
use crate::pattern::{PatternId, PatternKind, PatternTable, WorkflowPattern};
use crate::progress::ProgressFeed;
use crate::result::{AgentOutput, PartialResult, PatternResult, StageOutput, WorkflowResult};
use crate::telemetry::Telemetry;
use crate::tools::{PUBLISH_RESTART, RunDirectory};
use crate::vote::{Ballot, Tally, TieBreak, VoteConfig, VoteOutcome, match_tie_reply, tie_break_prompt};

/// Per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cancelling this token stops the run with a partial result.
    pub cancel: Option<CancellationToken>,
    /// Overrides the configured run timeout.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Everything pattern execution needs from the orchestrator.
pub(crate) struct PatternExecutor {
    pub agents: Arc<DashMap<AgentId, Arc<AgentHandle>>>,
    pub limiter: crate::limiter::ConcurrencyLimiter,
    pub bus: Arc<MessageBus>,
    pub shared: Arc<SharedMemoryStore>,
    pub runs: Arc<RunDirectory>,
    pub reducers: Arc<DashMap<String, Arc<dyn Reducer>>>,
    pub agreement: Arc<dyn AgreementCheck>,
    pub judge: Option<Arc<dyn Judge>>,
    /// Used by LLM-backed merges that name no synthesizer of their own.
    pub synthesizer: Option<AgentId>,
    pub config: OrchestratorConfig,
    pub progress: ProgressFeed,
    pub telemetry: Telemetry,
}

impl PatternExecutor {
    fn handle(&self, agent: &AgentId) -> OrchResult<Arc<AgentHandle>> {
        self.agents
            .get(agent)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| OrchestrationError::AgentNotFound(agent.clone()))
    }

    /// Configuration checks run before any agent is invoked.
    pub(crate) fn validate(&self, table: &PatternTable) -> OrchResult<()> {
        table.validate()?;

        if let Some(missing) = table.agent_ids().into_iter().find(|a| !self.agents.contains_key(a)) {
            return Err(OrchestrationError::AgentNotFound(missing));
        }

        for pattern in table.reachable() {
            match pattern {
                WorkflowPattern::ForkJoin(p) => self.validate_merge(&p.merge, p.synthesizer.as_ref())?,
                WorkflowPattern::Parallel(p) => self.validate_merge(&p.merge, p.synthesizer.as_ref())?,
                WorkflowPattern::Conditional(p) => {
                    if self.judge.is_none() && p.branches.iter().any(|b| b.predicate.needs_judge()) {
                        return Err(OrchestrationError::invalid(
                            "judged branch predicates require a judge on the orchestrator",
                        ));
                    }
                }
                WorkflowPattern::Iterative(p) if p.restart.enabled => {
                    let agents: Vec<AgentId> = table
                        .agents_reachable(p.base)
                        .into_iter()
                        .filter(|a| !self.agents.get(a).is_some_and(|h| h.has_tool(PUBLISH_RESTART)))
                        .collect();
                    if !agents.is_empty() {
                        return Err(OrchestrationError::MissingRestartTools { agents });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_merge(&self, merge: &MergeStrategy, synthesizer: Option<&AgentId>) -> OrchResult<()> {
        match merge {
            MergeStrategy::Custom(name) if !self.reducers.contains_key(name) => {
                Err(OrchestrationError::UnknownReducer(name.clone()))
            }
            strategy if strategy.needs_synthesizer() => {
                match synthesizer.or(self.synthesizer.as_ref()) {
                    Some(agent) if self.agents.contains_key(agent) => Ok(()),
                    Some(agent) => Err(OrchestrationError::AgentNotFound(agent.clone())),
                    None => Err(OrchestrationError::invalid(format!(
                        "merge strategy '{strategy}' requires a synthesizer agent"
                    ))),
                }
            }
            _ => Ok(()),
        }
    }

    /// Execute the table's root pattern.
    pub(crate) async fn execute(
        &self,
        table: &PatternTable,
        options: RunOptions,
    ) -> OrchResult<WorkflowResult> {
        self.validate(table)?;
        let (root, pattern) = table.root_pattern()?;
        let kind = pattern.kind();
        let run_id = format!("{}-{}", kind.as_str().replace('_', "-"), short_id());

        // A child token: cancelling on timeout must not cancel the caller's.
        let cancel = options.cancel.unwrap_or_default().child_token();
        let restart_topic = table.reachable().into_iter().find_map(|p| match p {
            WorkflowPattern::Iterative(it) if it.restart.enabled => Some(it.restart.restart_topic.clone()),
            _ => None,
        });
        let _registration =
            self.runs
                .register(&self.bus, &run_id, table.agent_ids(), restart_topic, cancel.clone());

        let run = Run {
            exec: self,
            table,
            run_id: run_id.clone(),
            kind,
            cancel: cancel.clone(),
            state: Mutex::new(RunState::default()),
        };

        let started = Instant::now();
        let started_at = Utc::now();
        info!(run_id = %run_id, pattern = %kind, agents = table.agent_ids().len(), "Workflow started");
        self.progress.emit(&run_id, kind, 0, None, "workflow started");

        let work = run.execute_pattern(root, Carry::root(&run_id));
        let outcome = match options.timeout.or(self.config.run_timeout) {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    Err(OrchestrationError::TimedOut { partial: None })
                }
            },
            None => work.await,
        };
        let duration = started.elapsed();

        match outcome {
            Ok(outcome) => {
                let state = run.into_state();
                let result = WorkflowResult {
                    run_id: run_id.clone(),
                    pattern: kind,
                    merged_output: outcome.merged,
                    cost: state.cost,
                    models_used: state.models,
                    pattern_result: outcome.result,
                    started_at,
                    duration_ms: duration.as_millis() as u64,
                };
                info!(
                    run_id = %run_id,
                    pattern = %kind,
                    llm_calls = result.cost.llm_calls,
                    cost_usd = result.cost.total_cost_usd,
                    duration_ms = result.duration_ms,
                    "Workflow completed"
                );
                self.progress.emit(&run_id, kind, 100, None, "workflow completed");
                self.telemetry.run(kind, "succeeded", duration);
                Ok(result)
            }
            Err(err) if err.is_interrupted() => {
                let timed_out = matches!(err, OrchestrationError::TimedOut { .. });
                let state = run.into_state();
                let partial = (!state.completed.is_empty()).then(|| {
                    Box::new(WorkflowResult {
                        run_id: run_id.clone(),
                        pattern: kind,
                        merged_output: concatenate(&state.completed),
                        cost: state.cost,
                        models_used: state.models,
                        pattern_result: PatternResult::Partial(PartialResult {
                            completed: state.completed,
                        }),
                        started_at,
                        duration_ms: duration.as_millis() as u64,
                    })
                });
                let (status, err) = if timed_out {
                    ("timed_out", OrchestrationError::TimedOut { partial })
                } else {
                    ("cancelled", OrchestrationError::Cancelled { partial })
                };
                info!(run_id = %run_id, pattern = %kind, status, "Workflow interrupted");
                self.telemetry.run(kind, status, duration);
                Err(err)
            }
            Err(err) => {
                warn!(run_id = %run_id, pattern = %kind, error = %err, "Workflow failed");
                self.telemetry.run(kind, "failed", duration);
                Err(err)
            }
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ============================================================================
// Run
// ============================================================================

#[derive(Default)]
struct RunState {
    cost: CostSummary,
    models: BTreeSet<String>,
    /// Every successful invocation, in completion order
    completed: Vec<AgentOutput>,
}

/// Output of one pattern execution.
pub(crate) struct Outcome {
    pub merged: String,
    pub result: PatternResult,
}

/// Context an iterative pattern passes to its base.
#[derive(Debug, Clone)]
pub(crate) struct Carry {
    /// Prefix of session ids: the run id, suffixed per iteration.
    pub scope: String,
    /// Merged output of the previous iteration
    pub previous: Option<String>,
    /// Where a restarted pipeline resumes
    pub resume: Option<Resume>,
}

#[derive(Debug, Clone)]
pub(crate) struct Resume {
    /// 0-based index of the first stage to run
    pub from_stage: usize,
    /// Outputs of the stages before `from_stage`
    pub preserved: Vec<StageOutput>,
}

impl Carry {
    fn root(run_id: &str) -> Self {
        Self {
            scope: run_id.to_string(),
            previous: None,
            resume: None,
        }
    }

    /// Context for a nested pattern: same sessions, nothing carried over.
    fn nested(&self) -> Self {
        Self::root(&self.scope)
    }
}

pub(crate) struct Run<'a> {
    exec: &'a PatternExecutor,
    table: &'a PatternTable,
    run_id: String,
    kind: PatternKind,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

fn cancelled() -> OrchestrationError {
    OrchestrationError::Cancelled { partial: None }
}

impl<'a> Run<'a> {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn into_state(self) -> RunState {
        self.state.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute_pattern(&self, id: PatternId, carry: Carry) -> BoxFuture<'_, OrchResult<Outcome>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(cancelled());
            }
            let pattern = self.table.get_or_err(id)?;
            debug!(run_id = %self.run_id, pattern_id = %id, pattern = %pattern.kind(), "Executing pattern");
            match pattern {
                WorkflowPattern::Debate(p) => self.debate(p, &carry).await,
                WorkflowPattern::ForkJoin(p) => self.fork_join(p, &carry).await,
                WorkflowPattern::Pipeline(p) => self.pipeline(p, &carry).await,
                WorkflowPattern::Parallel(p) => self.parallel(p, &carry).await,
                WorkflowPattern::Conditional(p) => self.conditional(p, &carry).await,
                WorkflowPattern::Iterative(p) => self.iterative(p, &carry).await,
            }
        })
    }

    /// Invoke one agent under a limiter slot, racing the run's cancellation.
    async fn invoke(
        &self,
        step: Step,
        agent_id: &AgentId,
        session: SessionId,
        input: &str,
    ) -> OrchResult<AgentOutput> {
        let handle = self.exec.handle(agent_id)?;
        let Some(_permit) = self.exec.limiter.acquire(&self.cancel).await else {
            return Err(cancelled());
        };

        debug!(run_id = %self.run_id, agent = %agent_id, step = %step, session = %session, "Invoking agent");
        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(cancelled()),
            response = handle.invoke(&session, input) => response,
        };
        let elapsed = started.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let output = AgentOutput::from_response(agent_id.clone(), response, elapsed);
                self.exec.telemetry.invocation(Some(&output.usage));
                let mut state = self.state();
                state.cost.record(agent_id, &output.usage);
                if let Some(model) = &output.model {
                    state.models.insert(model.clone());
                }
                state.completed.push(output.clone());
                Ok(output)
            }
            Err(e) => {
                self.exec.telemetry.invocation(None);
                warn!(run_id = %self.run_id, agent = %agent_id, step = %step, error = %e, "Agent invocation failed");
                Err(OrchestrationError::agent(step, e))
            }
        }
    }

    fn progress(&self, progress: u8, agent: Option<&AgentId>, message: impl Into<String>) {
        self.exec
            .progress
            .emit(&self.run_id, self.kind, progress, agent, message);
    }

    /// Merge fanned-out outputs (declaration order) with `strategy`.
    async fn merge(
        &self,
        strategy: &MergeStrategy,
        synthesizer: Option<&AgentId>,
        prompt: &str,
        outputs: &[AgentOutput],
        scope: &str,
    ) -> OrchResult<(String, Option<VoteOutcome>)> {
        match strategy {
            MergeStrategy::Concatenate => Ok((concatenate(outputs), None)),
            MergeStrategy::First => Ok((
                outputs.first().map(|o| o.output.clone()).unwrap_or_default(),
                None,
            )),
            MergeStrategy::Vote(config) => {
                let outcome = self.tally_vote(config, prompt, outputs, scope).await?;
                Ok((outcome.winner.clone(), Some(outcome)))
            }
            MergeStrategy::Custom(name) => {
                let reducer = self
                    .exec
                    .reducers
                    .get(name)
                    .map(|r| Arc::clone(r.value()))
                    .ok_or_else(|| OrchestrationError::UnknownReducer(name.clone()))?;
                let merged = reducer.reduce(prompt, outputs).await.map_err(|reason| {
                    OrchestrationError::ReducerFailed {
                        name: name.clone(),
                        reason,
                    }
                })?;
                Ok((merged, None))
            }
            llm => {
                let agent = synthesizer
                    .or(self.exec.synthesizer.as_ref())
                    .ok_or_else(|| {
                        OrchestrationError::invalid(format!("merge strategy '{llm}' requires a synthesizer agent"))
                    })?;
                let session = SessionId::for_step(scope, &format!("merge-{}", llm.name()), agent);
                let output = self
                    .invoke(Step::Merge, agent, session, &llm.synthesis_prompt(prompt, outputs))
                    .await?;
                Ok((output.output, None))
            }
        }
    }

    async fn tally_vote(
        &self,
        config: &VoteConfig,
        question: &str,
        outputs: &[AgentOutput],
        scope: &str,
    ) -> OrchResult<VoteOutcome> {
        let ballots: Vec<Ballot> = outputs
            .iter()
            .map(|o| Ballot::parse(o.agent_id.clone(), &o.output))
            .collect();
        let tally = Tally::count(&ballots);
        let leaders = tally.leaders(config.strategy);

        let (winner, tie_break) = match (leaders.as_slice(), &config.tie_breaker) {
            ([], _) => return Err(OrchestrationError::invalid("vote without ballots")),
            ([only], _) => (*only, None),
            (tied, Some(judge)) => {
                let session = SessionId::for_step(scope, "tie-break", judge);
                let reply = self
                    .invoke(Step::Merge, judge, session, &tie_break_prompt(question, tied, &ballots))
                    .await?;
                match match_tie_reply(&reply.output, tied) {
                    Some(choice) => (
                        choice,
                        Some(TieBreak::Judge {
                            agent_id: judge.clone(),
                        }),
                    ),
                    None => {
                        warn!(run_id = %self.run_id, judge = %judge, "Tie breaker named none of the tied choices");
                        (tied[0], Some(TieBreak::Order))
                    }
                }
            }
            (tied, None) => (tied[0], Some(TieBreak::Order)),
        };

        let consensus_reached = tally.carries(winner, config);
        debug!(
            run_id = %self.run_id,
            winner = %winner.choice,
            votes = winner.votes,
            ballots = tally.ballots,
            consensus_reached,
            "Vote tallied"
        );
        Ok(VoteOutcome {
            winner: winner.choice.clone(),
            strategy: config.strategy,
            consensus_reached,
            tally: tally.clone(),
            ballots,
            tie_break,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    //! In-process executor with real bus and stores for pattern tests.

    use super::*;
    use crate::limiter::ConcurrencyLimiter;
    use crate::agreement::JaccardAgreement;
    use crate::tools::{ToolContext, communication_tools, restart_tool};
    use weft_core::{Agent, BusConfig, CommunicationConfig, SharedMemoryConfig};
    use weft_memory::ReferenceStore;

    pub(crate) fn id(name: &str) -> AgentId {
        AgentId::new_unchecked(name)
    }

    pub(crate) struct Fixture {
        pub exec: PatternExecutor,
        tools: Arc<ToolContext>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let mut shared_config = SharedMemoryConfig::default();
            shared_config.overflow.enabled = false;
            Self::with_shared(shared_config)
        }

        pub(crate) fn with_shared(shared_config: SharedMemoryConfig) -> Self {
            Self::build(BusConfig::default(), shared_config)
        }

        pub(crate) fn with_bus(bus_config: BusConfig) -> Self {
            let mut shared_config = SharedMemoryConfig::default();
            shared_config.overflow.enabled = false;
            Self::build(bus_config, shared_config)
        }

        fn build(bus_config: BusConfig, shared_config: SharedMemoryConfig) -> Self {
            let store = Arc::new(ReferenceStore::new(CommunicationConfig::default()));
            let bus = Arc::new(MessageBus::new(bus_config, store).unwrap());
            let shared = Arc::new(SharedMemoryStore::new(shared_config));
            let runs = Arc::new(RunDirectory::default());
            let config = OrchestratorConfig {
                max_concurrent_invocations: 4,
                restart_wait: Duration::from_millis(200),
                ..OrchestratorConfig::default()
            };
            let tools = Arc::new(ToolContext {
                bus: Arc::clone(&bus),
                shared: Arc::clone(&shared),
                runs: Arc::clone(&runs),
                telemetry: Telemetry::default(),
            });
            let exec = PatternExecutor {
                agents: Arc::new(DashMap::new()),
                limiter: ConcurrencyLimiter::new(config.max_concurrent_invocations),
                bus,
                shared,
                runs,
                reducers: Arc::new(DashMap::new()),
                agreement: Arc::new(JaccardAgreement::default()),
                judge: None,
                synthesizer: None,
                progress: ProgressFeed::new(config.progress_buffer),
                config,
                telemetry: Telemetry::default(),
            };
            Self { exec, tools }
        }

        pub(crate) fn agent(self, name: &str, agent: Arc<dyn Agent>) -> Self {
            self.exec
                .agents
                .insert(id(name), Arc::new(AgentHandle::new(id(name), agent)));
            self
        }

        /// Register an agent holding the communication and restart tools.
        pub(crate) fn agent_with_tools(self, name: &str, agent: Arc<dyn Agent>) -> Self {
            let handle = Arc::new(AgentHandle::new(id(name), agent));
            for tool in communication_tools(&id(name), &self.tools) {
                handle.register_tool(tool).unwrap();
            }
            handle.register_tool(restart_tool(&id(name), &self.tools)).unwrap();
            self.exec.agents.insert(id(name), handle);
            self
        }

        pub(crate) fn judge(mut self, judge: Arc<dyn Judge>) -> Self {
            self.exec.judge = Some(judge);
            self
        }

        pub(crate) fn synthesizer(mut self, name: &str) -> Self {
            self.exec.synthesizer = Some(id(name));
            self
        }

        pub(crate) fn reducer(self, name: &str, reducer: Arc<dyn Reducer>) -> Self {
            self.exec.reducers.insert(name.to_string(), reducer);
            self
        }

        pub(crate) fn limit(mut self, capacity: usize) -> Self {
            self.exec.limiter = ConcurrencyLimiter::new(capacity);
            self
        }

        pub(crate) async fn run(&self, pattern: WorkflowPattern) -> OrchResult<WorkflowResult> {
            self.exec
                .execute(&PatternTable::single(pattern), RunOptions::default())
                .await
        }
    }
}
