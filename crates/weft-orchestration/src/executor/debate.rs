use futures::future::try_join_all;
use tracing::info;

use weft_core::SessionId;

use super::{Carry, Outcome, Run};
use crate::agreement::majority_cluster;
use crate::debate::{DebatePosition, DebateRound, round_prompt, synthesis_prompt};
use crate::error::{OrchResult, Step};
use crate::pattern::DebatePattern;
use crate::progress::percent;
use crate::result::{DebateResult, PatternResult};

impl Run<'_> {
    /// Rounds run until the agreement share reaches the threshold or the
    /// round budget is spent. Every participant sees the full transcript.
    pub(super) async fn debate(&self, p: &DebatePattern, carry: &Carry) -> OrchResult<Outcome> {
        let mut rounds: Vec<DebateRound> = Vec::new();

        for round in 1..=p.max_rounds {
            let prompt = round_prompt(&p.topic, round, &rounds);
            let replies = try_join_all(p.agent_ids.iter().map(|agent| {
                self.invoke(
                    Step::Round(round),
                    agent,
                    SessionId::for_round(&carry.scope, round, agent),
                    &prompt,
                )
            }))
            .await?;

            let positions: Vec<DebatePosition> = replies
                .into_iter()
                .map(|r| DebatePosition::parse(r.agent_id, &r.output, r.tools_used))
                .collect();
            let texts: Vec<&str> = positions.iter().map(|p| p.position.as_str()).collect();
            let agreement = self.exec.agreement.agreement(&texts);
            let consensus_reached = agreement >= p.consensus_threshold;

            let synthesis = match &p.moderator_id {
                Some(moderator) => {
                    let session =
                        SessionId::for_step(&carry.scope, &format!("round{round}-synthesis"), moderator);
                    self.invoke(
                        Step::Synthesis(round),
                        moderator,
                        session,
                        &synthesis_prompt(&p.topic, round, &positions),
                    )
                    .await?
                    .output
                }
                None => {
                    let clusters = self.exec.agreement.clusters(&texts);
                    majority_cluster(&clusters)
                        .and_then(|cluster| cluster.first())
                        .map(|&i| positions[i].position.clone())
                        .unwrap_or_default()
                }
            };

            info!(
                run_id = %self.run_id,
                round,
                agreement,
                consensus_reached,
                "Debate round completed"
            );
            self.progress(
                percent(round as usize, p.max_rounds as usize),
                None,
                format!("round {round} completed"),
            );

            rounds.push(DebateRound {
                round_number: round,
                positions,
                synthesis,
                consensus_reached,
                agreement,
            });
            if consensus_reached {
                break;
            }
        }

        let consensus_achieved = rounds.last().is_some_and(|r| r.consensus_reached);
        let merged = rounds.last().map(|r| r.synthesis.clone()).unwrap_or_default();
        Ok(Outcome {
            merged,
            result: PatternResult::Debate(DebateResult {
                rounds,
                consensus_achieved,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{Fixture, id};
    use crate::pattern::{DebatePattern, WorkflowPattern};
    use crate::result::PatternResult;
    use std::sync::Arc;
    use weft_testing::ScriptedAgent;

    fn debate(agents: &[&str], moderator: Option<&str>, threshold: f64) -> WorkflowPattern {
        WorkflowPattern::Debate(DebatePattern {
            topic: "Should we adopt Rust?".to_string(),
            agent_ids: agents.iter().map(|a| id(a)).collect(),
            moderator_id: moderator.map(id),
            max_rounds: 3,
            consensus_threshold: threshold,
        })
    }

    #[tokio::test]
    async fn test_unanimous_positions_stop_after_first_round() {
        let a = Arc::new(ScriptedAgent::replying("POSITION: Yes, adopt Rust\nCONFIDENCE: 90"));
        let b = Arc::new(ScriptedAgent::replying("POSITION: yes adopt rust\nCONFIDENCE: 70"));
        let fixture = Fixture::new().agent("a", a.clone()).agent("b", b.clone());

        let result = fixture.run(debate(&["a", "b"], None, 1.0)).await.unwrap();
        let PatternResult::Debate(debate) = &result.pattern_result else {
            panic!("expected debate result");
        };
        assert_eq!(debate.rounds.len(), 1);
        assert!(debate.consensus_achieved);
        assert_eq!(result.consensus_achieved(), Some(true));
        assert_eq!(result.merged_output, "Yes, adopt Rust");
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test]
    async fn test_disagreement_runs_every_round_with_transcript() {
        let a = Arc::new(ScriptedAgent::replying("POSITION: Adopt Rust"));
        let b = Arc::new(ScriptedAgent::replying("POSITION: Stay with Go"));
        let moderator = Arc::new(ScriptedAgent::replying("Split decision"));
        let fixture = Fixture::new()
            .agent("a", a.clone())
            .agent("b", b)
            .agent("mod", moderator.clone());

        let result = fixture.run(debate(&["a", "b"], Some("mod"), 1.0)).await.unwrap();
        let PatternResult::Debate(debate) = &result.pattern_result else {
            panic!("expected debate result");
        };
        assert_eq!(debate.rounds.len(), 3);
        assert!(!debate.consensus_achieved);
        assert!((debate.rounds[0].agreement - 0.5).abs() < 1e-9);
        assert_eq!(result.merged_output, "Split decision");
        assert_eq!(moderator.call_count(), 3);

        let inputs = a.inputs();
        assert!(inputs[0].contains("opening round"));
        assert!(inputs[2].contains("### Round 2"));
        assert!(inputs[2].contains("Stay with Go"));
        assert!(a.calls()[1].session_id.as_str().ends_with("-round2-a"));
    }

    #[tokio::test]
    async fn test_lower_threshold_accepts_majority() {
        let fixture = Fixture::new()
            .agent("a", Arc::new(ScriptedAgent::replying("POSITION: ship it")))
            .agent("b", Arc::new(ScriptedAgent::replying("POSITION: ship it")))
            .agent("c", Arc::new(ScriptedAgent::replying("POSITION: wait a quarter")));

        let result = fixture.run(debate(&["a", "b", "c"], None, 0.6)).await.unwrap();
        assert_eq!(result.consensus_achieved(), Some(true));
        assert_eq!(result.merged_output, "ship it");
        assert_eq!(result.cost.llm_calls, 3);
    }
}
