use tracing::{debug, info, warn};

use weft_core::{AgentError, SessionId};
use weft_memory::{SharedKey, WriteOptions};

use super::{Carry, Outcome, Run};
use crate::error::{OrchResult, OrchestrationError, Step};
use crate::pattern::{PipelinePattern, PipelineStage};
use crate::progress::percent;
use crate::result::{AgentOutput, PatternResult, PipelineResult, StageOutput};
use crate::template::{StageContext, retry_prompt, validation_passed, validation_prompt};

/// Shared memory key (workflow namespace, run scope) of a stage's output.
pub fn stage_output_key(stage: usize) -> String {
    format!("stage-{stage}-output")
}

impl Run<'_> {
    /// Stages run strictly in order; a failed stage or a validation that
    /// still rejects after the stage's retries stops the pipeline. Every
    /// accepted output is also written to the run's workflow memory. A
    /// restarted iteration may resume mid-pipeline with the earlier outputs
    /// preserved.
    pub(super) async fn pipeline(&self, p: &PipelinePattern, carry: &Carry) -> OrchResult<Outcome> {
        let (start, mut stages) = match &carry.resume {
            Some(resume) => (resume.from_stage.min(p.stages.len()), resume.preserved.clone()),
            None => (0, Vec::new()),
        };
        if start > 0 {
            debug!(run_id = %self.run_id, from_stage = start + 1, preserved = stages.len(), "Resuming pipeline");
            // a reset between iterations may have cleared them
            for preserved in &stages {
                self.store_stage_output(preserved.stage, &preserved.output).await?;
            }
        }

        for (index, stage) in p.stages.iter().enumerate().skip(start) {
            let number = index + 1;
            let previous = stages
                .last()
                .map(|s| s.output.output.as_str())
                .unwrap_or(p.initial_input.as_str());
            let input = stage.input_mapping.render(&StageContext {
                input: &p.initial_input,
                previous,
                history: &stages,
                pass_full_history: p.pass_full_history,
            });

            let output = self.run_stage(number, stage, &input, carry).await?;
            self.store_stage_output(number, &output).await?;

            self.progress(
                percent(number, p.stages.len()),
                Some(&stage.agent_id),
                format!("stage {number} completed"),
            );
            stages.push(StageOutput {
                stage: number,
                output,
            });
        }

        let merged = stages
            .last()
            .map(|s| s.output.output.clone())
            .unwrap_or_default();
        Ok(Outcome {
            merged,
            result: PatternResult::Pipeline(PipelineResult { stages }),
        })
    }

    /// One stage, re-run with the validator's feedback while its output is
    /// rejected and retries remain.
    async fn run_stage(
        &self,
        number: usize,
        stage: &PipelineStage,
        input: &str,
        carry: &Carry,
    ) -> OrchResult<AgentOutput> {
        let agent = &stage.agent_id;
        let step = Step::Stage(number, agent.clone());
        let mut output = self
            .invoke(
                step.clone(),
                agent,
                SessionId::for_stage(&carry.scope, number, agent),
                input,
            )
            .await?;
        let Some(check) = &stage.validation_prompt else {
            return Ok(output);
        };

        let mut attempt = 0;
        loop {
            let label = match attempt {
                0 => format!("stage{number}-validation"),
                n => format!("stage{number}-retry{n}-validation"),
            };
            let verdict = self
                .invoke(
                    step.clone(),
                    agent,
                    SessionId::for_step(&carry.scope, &label, agent),
                    &validation_prompt(check, &output.output),
                )
                .await?;
            if validation_passed(&verdict.output) {
                if attempt > 0 {
                    info!(run_id = %self.run_id, stage = number, agent = %agent, attempt, "Stage output accepted after retry");
                }
                return Ok(output);
            }
            if attempt >= stage.validation_retries {
                warn!(run_id = %self.run_id, stage = number, agent = %agent, retries = attempt, "Stage output rejected by validation");
                return Err(OrchestrationError::agent(
                    step,
                    AgentError::InvalidResponse(format!(
                        "validation rejected output: {}",
                        verdict.output.trim()
                    )),
                ));
            }

            attempt += 1;
            warn!(
                run_id = %self.run_id,
                stage = number,
                agent = %agent,
                attempt,
                max_retries = stage.validation_retries,
                "Stage output rejected, retrying with feedback"
            );
            output = self
                .invoke(
                    step.clone(),
                    agent,
                    SessionId::for_step(&carry.scope, &format!("stage{number}-retry{attempt}"), agent),
                    &retry_prompt(input, &output.output, &verdict.output, attempt),
                )
                .await?;
        }
    }

    async fn store_stage_output(&self, number: usize, output: &AgentOutput) -> OrchResult<()> {
        let key = SharedKey::workflow(self.run_id.clone(), stage_output_key(number));
        self.exec
            .shared
            .put(
                key,
                output.output.as_bytes().to_vec(),
                WriteOptions::owned_by(output.agent_id.clone()),
            )
            .await
            .map_err(|e| {
                OrchestrationError::memory(Step::Stage(number, output.agent_id.clone()), e)
            })?;
        Ok(())
    }
}
