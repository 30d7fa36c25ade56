use futures::future::join_all;
use tracing::{info, warn};

use weft_core::SessionId;

use super::{Carry, Outcome, Run};
use crate::error::{OrchResult, OrchestrationError, Step};
use crate::merge::MergeStrategy;
use crate::pattern::ParallelPattern;
use crate::result::{AgentOutput, ParallelResult, PatternResult, TaskOutcome, TaskStatus};

impl Run<'_> {
    /// Tasks run concurrently and fail independently. The pattern fails only
    /// when every task failed or the run was interrupted.
    pub(super) async fn parallel(&self, p: &ParallelPattern, carry: &Carry) -> OrchResult<Outcome> {
        let results = join_all(p.tasks.iter().enumerate().map(|(i, task)| {
            self.invoke(
                Step::Task(i + 1, task.agent_id.clone()),
                &task.agent_id,
                SessionId::for_task(&carry.scope, i + 1, &task.agent_id),
                &task.input,
            )
        }))
        .await;

        let mut tasks = Vec::with_capacity(results.len());
        for ((i, task), result) in p.tasks.iter().enumerate().zip(results) {
            let status = match result {
                Ok(output) => TaskStatus::Succeeded { output },
                Err(err) if err.is_interrupted() => return Err(err),
                Err(err) => TaskStatus::Failed {
                    code: err.error_code().to_string(),
                    message: err.to_string(),
                },
            };
            tasks.push(TaskOutcome {
                index: i + 1,
                agent_id: task.agent_id.clone(),
                metadata: task.metadata.clone(),
                status,
            });
        }

        let succeeded: Vec<AgentOutput> = tasks.iter().filter_map(|t| t.output().cloned()).collect();
        let failed = tasks.len() - succeeded.len();
        if succeeded.is_empty() {
            warn!(run_id = %self.run_id, failed, "Every parallel task failed");
            return Err(OrchestrationError::AllTasksFailed { failed });
        }
        info!(run_id = %self.run_id, succeeded = succeeded.len(), failed, "Parallel tasks finished");
        self.progress(80, None, format!("{} of {} tasks succeeded", succeeded.len(), tasks.len()));

        let (merged, vote) = match &p.merge {
            MergeStrategy::Concatenate => (concatenate_tasks(&tasks), None),
            strategy => {
                let prompt = p
                    .tasks
                    .iter()
                    .map(|t| t.input.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                self.merge(strategy, p.synthesizer.as_ref(), &prompt, &succeeded, &carry.scope)
                    .await?
            }
        };

        Ok(Outcome {
            merged,
            result: PatternResult::Parallel(ParallelResult {
                tasks,
                merge: p.merge.to_string(),
                vote,
            }),
        })
    }
}

/// Successful task outputs under `=== Task <n> (Agent <id>) ===` headers.
fn concatenate_tasks(tasks: &[TaskOutcome]) -> String {
    tasks
        .iter()
        .filter_map(|t| {
            t.output()
                .map(|o| format!("=== Task {} (Agent {}) ===\n{}", t.index, t.agent_id, o.output))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
