use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use weft_core::{AgentId, Topic, TopicPattern};
use weft_memory::Namespace;
use weft_mesh::{MeshResult, OutgoingMessage, PublishReceipt, Subscription};

use super::{Carry, Outcome, Resume, Run, cancelled};
use crate::error::{OrchResult, OrchestrationError, Step};
use crate::pattern::{IterativePattern, RestartPolicy, WorkflowPattern};
use crate::progress::percent;
use crate::result::{IterationRecord, IterativeResult, PatternResult};
use crate::tools::{
    CONTROL_MESSAGE_TYPE, KIND_ITERATION_COMPLETED, KIND_METADATA, KIND_RESTART_RESPONSE, RUN_ID_METADATA,
    RestartResponse, RestartSignal, restart_filter, restart_response_topic,
};

/// Sender and subscriber id the executor uses on the restart topic.
const EXECUTOR_AGENT: &str = "weft.executor";

/// Last accepted restart per target stage (`None` = whole base pattern).
type Cooldowns = HashMap<Option<AgentId>, Instant>;

impl Run<'_> {
    /// Run the base pattern, then start another iteration for each accepted
    /// restart signal until none arrives or the iteration budget is spent.
    pub(super) async fn iterative(&self, p: &IterativePattern, carry: &Carry) -> OrchResult<Outcome> {
        if !p.restart.enabled {
            let outcome = self.execute_pattern(p.base, carry.clone()).await?;
            return Ok(Outcome {
                merged: outcome.merged,
                result: PatternResult::Iterative(IterativeResult {
                    iterations: vec![IterationRecord {
                        iteration: 1,
                        result: outcome.result,
                        restart: None,
                    }],
                }),
            });
        }

        let policy = &p.restart;
        let base = self.table.get_or_err(p.base)?;
        // Subscribed before the first iteration so no signal is missed.
        let mut signals = self
            .exec
            .bus
            .subscribe_with(
                TopicPattern::exact(&policy.restart_topic),
                AgentId::new_unchecked(EXECUTOR_AGENT),
                restart_filter(&self.run_id),
            )
            .map_err(|e| OrchestrationError::bus(Step::Restart, e))?;

        let mut cooldowns = Cooldowns::new();
        let mut iterations: Vec<IterationRecord> = Vec::new();
        let mut next = Carry {
            scope: carry.scope.clone(),
            previous: carry.previous.clone(),
            resume: None,
        };
        let mut merged = String::new();

        for iteration in 1..=p.max_iterations {
            debug!(run_id = %self.run_id, iteration, resume = next.resume.is_some(), "Starting iteration");
            let outcome = self.execute_pattern(p.base, next.clone()).await?;
            merged = outcome.merged;
            self.iteration_completed(&policy.restart_topic, iteration, &merged)
                .await?;
            self.progress(
                percent(iteration as usize, p.max_iterations as usize),
                None,
                format!("iteration {iteration} completed"),
            );

            let signal = if iteration < p.max_iterations {
                self.await_restart(&mut signals, base, policy, &mut cooldowns, iteration)
                    .await?
            } else {
                None
            };
            let resume = signal
                .as_ref()
                .and_then(|s| resume_point(base, policy, s, &outcome.result));
            iterations.push(IterationRecord {
                iteration,
                result: outcome.result,
                restart: signal.clone(),
            });
            let Some(signal) = signal else {
                break;
            };

            info!(
                run_id = %self.run_id,
                iteration,
                requested_by = %signal.requested_by,
                target_stage = ?signal.target_stage,
                reason = %signal.reason,
                "Restarting"
            );
            if policy.reset_shared_memory {
                let cleared = self
                    .exec
                    .shared
                    .clear_scope(Namespace::Workflow, &self.run_id)
                    .await;
                debug!(run_id = %self.run_id, cleared, "Workflow memory reset");
            }
            next = Carry {
                scope: format!("{}-iter{}", carry.scope, iteration + 1),
                previous: Some(merged.clone()),
                resume,
            };
        }

        Ok(Outcome {
            merged,
            result: PatternResult::Iterative(IterativeResult { iterations }),
        })
    }

    async fn iteration_completed(&self, topic: &Topic, iteration: u32, output: &str) -> OrchResult<()> {
        let step = Step::Iteration(iteration);
        let message = OutgoingMessage::json(&json!({
            "run_id": self.run_id,
            "iteration": iteration,
            "output": output,
        }))
        .map_err(|e| OrchestrationError::bus(step.clone(), e))?
        .with_type(CONTROL_MESSAGE_TYPE)
        .from_agent(AgentId::new_unchecked(EXECUTOR_AGENT))
        .with_metadata(KIND_METADATA, KIND_ITERATION_COMPLETED)
        .with_metadata(RUN_ID_METADATA, self.run_id.clone());
        self.publish_control(topic, message)
            .await?
            .map_err(|e| OrchestrationError::bus(step, e))?;
        Ok(())
    }

    /// Publish an executor control message. The outer error is the run
    /// being cancelled while the publish waits on a full queue.
    async fn publish_control(
        &self,
        topic: &Topic,
        message: OutgoingMessage,
    ) -> OrchResult<MeshResult<PublishReceipt>> {
        let published = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(cancelled()),
            published = self.exec.bus.publish(topic, message) => published,
        };
        if let Ok(receipt) = &published {
            self.exec.telemetry.published(receipt);
        }
        Ok(published)
    }

    /// Tell the requester whether its restart was taken. Failing to answer
    /// does not fail the run.
    async fn respond_restart(&self, signal: &RestartSignal, verdict: Result<u32, &str>) -> OrchResult<()> {
        let response = RestartResponse {
            run_id: self.run_id.clone(),
            accepted: verdict.is_ok(),
            target_stage: signal.target_stage.clone(),
            reason: verdict.err().unwrap_or_default().to_string(),
            next_iteration: verdict.ok(),
        };
        let topic = restart_response_topic(&signal.requested_by);
        let message = match OutgoingMessage::json(&response) {
            Ok(message) => message
                .with_type(CONTROL_MESSAGE_TYPE)
                .from_agent(AgentId::new_unchecked(EXECUTOR_AGENT))
                .with_metadata(KIND_METADATA, KIND_RESTART_RESPONSE)
                .with_metadata(RUN_ID_METADATA, self.run_id.clone()),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Failed to encode restart response");
                return Ok(());
            }
        };
        if let Err(e) = self.publish_control(&topic, message).await? {
            warn!(run_id = %self.run_id, topic = %topic, error = %e, "Failed to send restart response");
        }
        Ok(())
    }

    /// Take the first acceptable restart signal, waiting up to the
    /// configured restart wait. Signals queued behind the accepted one are
    /// coalesced into it. Every signal taken off the topic is answered on
    /// the requester's response topic.
    async fn await_restart(
        &self,
        signals: &mut Subscription,
        base: &WorkflowPattern,
        policy: &RestartPolicy,
        cooldowns: &mut Cooldowns,
        iteration: u32,
    ) -> OrchResult<Option<RestartSignal>> {
        let deadline = tokio::time::Instant::now() + self.exec.config.restart_wait;
        loop {
            let delivery = match signals.try_recv() {
                Some(delivery) => delivery,
                None => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(cancelled()),
                        delivery = signals.recv_timeout(remaining) => match delivery {
                            Some(delivery) => delivery,
                            None => return Ok(None),
                        },
                    }
                }
            };

            let parsed = delivery.json::<RestartSignal>();
            delivery.ack();
            let signal = match parsed {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(run_id = %self.run_id, error = %e, "Ignoring malformed restart signal");
                    continue;
                }
            };

            match check_restart(base, policy, &signal, cooldowns) {
                Ok(()) => {
                    cooldowns.insert(signal.target_stage.clone(), Instant::now());
                    let coalesced = signals.drain();
                    if !coalesced.is_empty() {
                        debug!(run_id = %self.run_id, coalesced = coalesced.len(), "Coalesced queued restart signals");
                    }
                    coalesced.into_iter().for_each(|d| d.ack());
                    self.respond_restart(&signal, Ok(iteration + 1)).await?;
                    return Ok(Some(signal));
                }
                Err(reason) => {
                    warn!(
                        run_id = %self.run_id,
                        requested_by = %signal.requested_by,
                        target_stage = ?signal.target_stage,
                        reason,
                        "Restart signal rejected"
                    );
                    self.respond_restart(&signal, Err(reason)).await?;
                }
            }
        }
    }
}

fn check_restart(
    base: &WorkflowPattern,
    policy: &RestartPolicy,
    signal: &RestartSignal,
    cooldowns: &Cooldowns,
) -> Result<(), &'static str> {
    if let Some(target) = &signal.target_stage {
        if let WorkflowPattern::Pipeline(pipeline) = base
            && !pipeline.stages.iter().any(|s| &s.agent_id == target)
        {
            return Err("target is not a stage of the pipeline");
        }
        if !policy.restartable_stages.is_empty() && !policy.restartable_stages.contains(target) {
            return Err("target stage is not restartable");
        }
    }
    if let Some(last) = cooldowns.get(&signal.target_stage)
        && last.elapsed() < policy.cooldown
    {
        return Err("target stage is cooling down");
    }
    Ok(())
}

/// Where a restarted pipeline resumes. `None` re-runs the whole base.
fn resume_point(
    base: &WorkflowPattern,
    policy: &RestartPolicy,
    signal: &RestartSignal,
    previous: &PatternResult,
) -> Option<Resume> {
    if !policy.preserve_outputs {
        return None;
    }
    let (WorkflowPattern::Pipeline(pipeline), PatternResult::Pipeline(previous)) = (base, previous) else {
        return None;
    };
    let target = signal.target_stage.as_ref()?;
    let from_stage = pipeline.stages.iter().position(|s| &s.agent_id == target)?;
    Some(Resume {
        from_stage,
        preserved: previous.stages.iter().take(from_stage).cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::RunOptions;
    use super::super::fixture::{Fixture, id};
    use crate::pattern::{
        IterativePattern, PatternTable, PipelinePattern, PipelineStage, RestartPolicy, WorkflowPattern,
    };
    use crate::result::PatternResult;
    use crate::template::InputMapping;
    use crate::error::OrchestrationError;
    use crate::tools::{PUBLISH_RESTART, RestartResponse, SHARED_MEMORY_WRITE, restart_response_topic};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use weft_core::{BusConfig, Topic, TopicPattern};
    use weft_memory::{MemoryError, SharedKey};
    use weft_mesh::{OutgoingMessage, Subscription};
    use weft_testing::ScriptedAgent;

    fn stage(agent: &str) -> PipelineStage {
        PipelineStage {
            agent_id: id(agent),
            input_mapping: InputMapping::Previous,
            validation_prompt: None,
            validation_retries: 0,
        }
    }

    /// Iterative over planner -> coder -> tester.
    fn table(max_iterations: u32, restart: RestartPolicy) -> PatternTable {
        let mut table = PatternTable::new();
        let base = table.add(WorkflowPattern::Pipeline(PipelinePattern {
            initial_input: "build a parser".to_string(),
            stages: vec![stage("planner"), stage("coder"), stage("tester")],
            pass_full_history: false,
        }));
        let root = table.add(WorkflowPattern::Iterative(IterativePattern {
            base,
            max_iterations,
            restart,
        }));
        table.set_root(root);
        table
    }

    fn policy() -> RestartPolicy {
        RestartPolicy {
            enabled: true,
            ..RestartPolicy::default()
        }
    }

    fn restart_to(target: Option<&str>) -> serde_json::Value {
        match target {
            Some(target) => json!({"reason": "tests failed", "target_stage": target}),
            None => json!({"reason": "start over"}),
        }
    }

    fn responses(fixture: &Fixture, requester: &str) -> Subscription {
        fixture
            .exec
            .bus
            .subscribe(
                TopicPattern::exact(&restart_response_topic(&id(requester))),
                id("observer"),
            )
            .unwrap()
    }

    struct Team {
        planner: Arc<ScriptedAgent>,
        coder: Arc<ScriptedAgent>,
        tester: Arc<ScriptedAgent>,
    }

    fn assemble(tester: ScriptedAgent) -> (Fixture, Team) {
        let team = Team {
            planner: Arc::new(ScriptedAgent::replying("plan")),
            coder: Arc::new(ScriptedAgent::sequence(["code v1", "code v2", "code v3"])),
            tester: Arc::new(tester),
        };
        let fixture = Fixture::new()
            .agent_with_tools("planner", team.planner.clone())
            .agent_with_tools("coder", team.coder.clone())
            .agent_with_tools("tester", team.tester.clone());
        (fixture, team)
    }

    #[tokio::test]
    async fn test_restart_resumes_at_target_stage() {
        let (fixture, team) = assemble(
            ScriptedAgent::sequence(["2 failures", "all green"])
                .calling_tool_on(1, PUBLISH_RESTART, restart_to(Some("coder"))),
        );
        let mut answers = responses(&fixture, "tester");

        let result = fixture
            .exec
            .execute(&table(3, policy()), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(team.planner.call_count(), 1);
        assert_eq!(team.coder.call_count(), 2);
        assert_eq!(team.tester.call_count(), 2);
        assert_eq!(team.coder.inputs()[1], "plan");
        assert_eq!(result.merged_output, "all green");

        let PatternResult::Iterative(iterative) = &result.pattern_result else {
            panic!("expected iterative result");
        };
        assert_eq!(iterative.iterations.len(), 2);
        let signal = iterative.iterations[0].restart.as_ref().unwrap();
        assert_eq!(signal.target_stage, Some(id("coder")));
        assert_eq!(signal.requested_by, id("tester"));
        assert!(iterative.iterations[1].restart.is_none());
        let PatternResult::Pipeline(second) = &iterative.iterations[1].result else {
            panic!("expected pipeline iteration");
        };
        assert_eq!(second.stages.len(), 3);
        assert_eq!(second.stages[0].output.output, "plan");
        assert!(
            team.coder.calls()[1]
                .session_id
                .as_str()
                .ends_with("-iter2-stage2-coder")
        );

        let delivery = answers.try_recv().unwrap();
        let response: RestartResponse = delivery.json().unwrap();
        delivery.ack();
        assert!(response.accepted);
        assert_eq!(response.run_id, result.run_id);
        assert_eq!(response.target_stage, Some(id("coder")));
        assert_eq!(response.next_iteration, Some(2));
        assert!(answers.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_without_preserved_outputs_reruns_everything() {
        let (fixture, team) = assemble(
            ScriptedAgent::replying("failing").calling_tool_on(1, PUBLISH_RESTART, restart_to(Some("coder"))),
        );
        let policy = RestartPolicy {
            preserve_outputs: false,
            ..policy()
        };
        fixture
            .exec
            .execute(&table(3, policy), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(team.planner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_rejects_repeated_restart() {
        let (fixture, team) = assemble(
            ScriptedAgent::replying("still failing").calling_tool(PUBLISH_RESTART, restart_to(Some("coder"))),
        );
        let policy = RestartPolicy {
            cooldown: Duration::from_secs(3600),
            ..policy()
        };
        let mut answers = responses(&fixture, "tester");
        let result = fixture
            .exec
            .execute(&table(5, policy), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(team.coder.call_count(), 2);
        let PatternResult::Iterative(iterative) = &result.pattern_result else {
            panic!("expected iterative result");
        };
        assert_eq!(iterative.iterations.len(), 2);

        let answers: Vec<RestartResponse> = std::iter::from_fn(|| answers.try_recv())
            .map(|d| {
                let response = d.json().unwrap();
                d.ack();
                response
            })
            .collect();
        assert_eq!(answers.len(), 2);
        assert!(answers[0].accepted);
        assert!(!answers[1].accepted);
        assert_eq!(answers[1].reason, "target stage is cooling down");
        assert_eq!(answers[1].next_iteration, None);
    }

    #[tokio::test]
    async fn test_unknown_or_unrestartable_target_is_ignored() {
        let (fixture, team) = assemble(
            ScriptedAgent::replying("failing").calling_tool_on(1, PUBLISH_RESTART, restart_to(Some("reviewer"))),
        );
        fixture
            .exec
            .execute(&table(3, policy()), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(team.coder.call_count(), 1);

        let (fixture, team) = assemble(
            ScriptedAgent::replying("failing").calling_tool_on(1, PUBLISH_RESTART, restart_to(Some("coder"))),
        );
        let policy = RestartPolicy {
            restartable_stages: vec![id("tester")],
            ..policy()
        };
        fixture
            .exec
            .execute(&table(3, policy), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(team.coder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_iteration_budget_bounds_restarts() {
        let (fixture, team) = assemble(
            ScriptedAgent::replying("failing").calling_tool(PUBLISH_RESTART, restart_to(None)),
        );
        let result = fixture
            .exec
            .execute(&table(2, policy()), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(team.planner.call_count(), 2);
        let PatternResult::Iterative(iterative) = &result.pattern_result else {
            panic!("expected iterative result");
        };
        assert_eq!(iterative.iterations.len(), 2);
        assert!(iterative.iterations[1].restart.is_none());
    }

    #[tokio::test]
    async fn test_reset_clears_workflow_memory() {
        let planner = Arc::new(
            ScriptedAgent::replying("plan").calling_tool_on(
                1,
                SHARED_MEMORY_WRITE,
                json!({"key": "notes", "value": "first attempt"}),
            ),
        );
        let tester = Arc::new(
            ScriptedAgent::replying("failing").calling_tool_on(1, PUBLISH_RESTART, restart_to(None)),
        );
        let fixture = Fixture::new()
            .agent_with_tools("planner", planner.clone())
            .agent_with_tools("coder", Arc::new(ScriptedAgent::replying("code")))
            .agent_with_tools("tester", tester);
        let policy = RestartPolicy {
            reset_shared_memory: true,
            ..policy()
        };

        let result = fixture
            .exec
            .execute(&table(3, policy), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(planner.call_count(), 2);
        let err = fixture
            .exec
            .shared
            .get(&SharedKey::workflow(result.run_id.clone(), "notes"))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::EntryNotFound(_)));
    }

    #[tokio::test]
    async fn test_disabled_restart_runs_once() {
        let tester = Arc::new(
            ScriptedAgent::replying("done").calling_tool(PUBLISH_RESTART, restart_to(None)),
        );
        let fixture = Fixture::new()
            .agent("planner", Arc::new(ScriptedAgent::replying("plan")))
            .agent("coder", Arc::new(ScriptedAgent::replying("code")))
            .agent("tester", tester.clone());

        let result = fixture
            .exec
            .execute(&table(3, RestartPolicy::default()), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(tester.call_count(), 1);
        assert_eq!(result.merged_output, "done");
        let PatternResult::Iterative(iterative) = &result.pattern_result else {
            panic!("expected iterative result");
        };
        assert_eq!(iterative.iterations.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_iteration_notice() {
        let bus_config = BusConfig {
            buffer_size: 1,
            ..BusConfig::default()
        };
        let fixture = Fixture::with_bus(bus_config)
            .agent_with_tools("planner", Arc::new(ScriptedAgent::replying("plan")))
            .agent_with_tools("coder", Arc::new(ScriptedAgent::replying("code")))
            .agent_with_tools("tester", Arc::new(ScriptedAgent::replying("done")));

        // a listener that never reads, its queue already full
        let topic = Topic::new_unchecked("workflow.restart");
        let _stalled = fixture
            .exec
            .bus
            .subscribe(TopicPattern::exact(&topic), id("stalled"))
            .unwrap();
        fixture
            .exec
            .bus
            .publish(&topic, OutgoingMessage::text("filler"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            fixture
                .exec
                .execute(&table(2, policy()), RunOptions::default().with_cancel(cancel)),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(err, OrchestrationError::Cancelled { .. }));
    }
}
