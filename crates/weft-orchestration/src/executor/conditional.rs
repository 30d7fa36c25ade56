use tracing::{debug, info};

use weft_core::{AgentError, SessionId};

use super::{Carry, Outcome, Run, cancelled};
use crate::error::{OrchResult, OrchestrationError, Step};
use crate::pattern::ConditionalPattern;
use crate::predicate::BranchPredicate;
use crate::result::{ConditionalResult, PatternResult, SelectedBranch};

impl Run<'_> {
    /// Evaluate the condition once, then run only the first matching branch.
    pub(super) async fn conditional(&self, p: &ConditionalPattern, carry: &Carry) -> OrchResult<Outcome> {
        let condition = self
            .invoke(
                Step::Condition,
                &p.condition_agent_id,
                SessionId::for_step(&carry.scope, "condition", &p.condition_agent_id),
                &p.condition_prompt,
            )
            .await?;

        let mut selected = None;
        for (i, branch) in p.branches.iter().enumerate() {
            let matched = match branch.predicate.matches_text(&condition.output) {
                Some(matched) => matched,
                None => self.judge_branch(&branch.predicate, &condition.output).await?,
            };
            if matched {
                selected = Some((SelectedBranch::Branch(i + 1), branch.pattern));
                break;
            }
        }
        let (selected, pattern) = match (selected, p.default_branch) {
            (Some(hit), _) => hit,
            (None, Some(default)) => (SelectedBranch::Default, default),
            (None, None) => {
                return Err(OrchestrationError::NoBranchMatched {
                    output: condition.output,
                });
            }
        };
        info!(run_id = %self.run_id, branch = ?selected, pattern_id = %pattern, "Condition routed");
        self.progress(20, Some(&p.condition_agent_id), "condition evaluated");

        let branch = self.execute_pattern(pattern, carry.nested()).await?;
        Ok(Outcome {
            merged: branch.merged,
            result: PatternResult::Conditional(ConditionalResult {
                condition_output: condition,
                selected,
                branch: Box::new(branch.result),
            }),
        })
    }

    /// Ask the judge about a judged predicate. The judge is a model call
    /// like any other: it takes a limiter slot and yields to cancellation.
    async fn judge_branch(&self, predicate: &BranchPredicate, output: &str) -> OrchResult<bool> {
        let BranchPredicate::Judge { criteria, .. } = predicate else {
            return Ok(false);
        };
        let judge = self.exec.judge.as_ref().ok_or_else(|| {
            OrchestrationError::agent(
                Step::Condition,
                AgentError::InvalidResponse("judged branch without a judge".to_string()),
            )
        })?;
        let Some(_permit) = self.exec.limiter.acquire(&self.cancel).await else {
            return Err(cancelled());
        };
        let verdict = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(cancelled()),
            verdict = judge.evaluate(criteria, output) => verdict,
        }
        .map_err(|e| OrchestrationError::agent(Step::Condition, e))?;
        debug!(run_id = %self.run_id, score = verdict.score, passed = verdict.passed, "Branch judged");
        Ok(predicate.accepts(&verdict))
    }
}
