use futures::future::try_join_all;
use tracing::debug;

use weft_core::SessionId;

use super::{Carry, Outcome, Run};
use crate::error::{OrchResult, Step};
use crate::pattern::ForkJoinPattern;
use crate::result::{ForkJoinResult, PatternResult};

impl Run<'_> {
    /// Barrier join: the first branch failure fails the pattern and the
    /// remaining branches are dropped.
    pub(super) async fn fork_join(&self, p: &ForkJoinPattern, carry: &Carry) -> OrchResult<Outcome> {
        let prompt = match (&carry.previous, p.share_previous) {
            (Some(previous), true) => format!("{}\n\nPrevious iteration result:\n{previous}", p.prompt),
            _ => p.prompt.clone(),
        };

        let outputs = try_join_all(p.agent_ids.iter().enumerate().map(|(i, agent)| {
            self.invoke(
                Step::Branch(i + 1),
                agent,
                SessionId::for_branch(&carry.scope, i + 1, agent),
                &prompt,
            )
        }))
        .await?;
        debug!(run_id = %self.run_id, branches = outputs.len(), merge = %p.merge, "Branches joined");
        self.progress(80, None, format!("{} branches joined", outputs.len()));

        let (merged, vote) = self
            .merge(&p.merge, p.synthesizer.as_ref(), &prompt, &outputs, &carry.scope)
            .await?;
        Ok(Outcome {
            merged,
            result: PatternResult::ForkJoin(ForkJoinResult {
                outputs,
                merge: p.merge.to_string(),
                vote,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{Fixture, id};
    use crate::error::{OrchestrationError, Step};
    use crate::merge::{MergeStrategy, Reducer};
    use crate::pattern::{ForkJoinPattern, WorkflowPattern};
    use crate::result::{AgentOutput, PatternResult};
    use crate::vote::{TieBreak, VoteConfig, VoteStrategy};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use weft_testing::{FailingAgent, ScriptedAgent, SlowAgent};

    fn fork_join(agents: &[&str], merge: MergeStrategy) -> WorkflowPattern {
        WorkflowPattern::ForkJoin(ForkJoinPattern {
            prompt: "Pick a database".to_string(),
            agent_ids: agents.iter().map(|a| id(a)).collect(),
            merge,
            synthesizer: None,
            share_previous: false,
        })
    }

    #[tokio::test]
    async fn test_concatenate_in_declaration_order() {
        let fixture = Fixture::new()
            .agent("slow", Arc::new(ScriptedAgent::replying("postgres").with_delay(Duration::from_millis(30))))
            .agent("fast", Arc::new(ScriptedAgent::replying("sqlite")));

        let result = fixture
            .run(fork_join(&["slow", "fast"], MergeStrategy::Concatenate))
            .await
            .unwrap();
        assert_eq!(
            result.merged_output,
            "=== Agent slow ===\npostgres\n\n=== Agent fast ===\nsqlite"
        );
        let PatternResult::ForkJoin(fj) = &result.pattern_result else {
            panic!("expected fork-join result");
        };
        assert_eq!(fj.outputs[0].agent_id, id("slow"));
        assert_eq!(fj.merge, "concatenate");
    }

    #[tokio::test]
    async fn test_branch_failure_fails_whole_pattern() {
        let slow = Arc::new(SlowAgent::new(Duration::from_millis(500)).with_reply("late"));
        let fixture = Fixture::new()
            .agent("ok", slow.clone())
            .agent("bad", Arc::new(FailingAgent::new("rate limited")));

        let err = fixture
            .run(fork_join(&["ok", "bad"], MergeStrategy::Concatenate))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Agent { step: Step::Branch(2), .. }));
        assert_eq!(slow.completed(), 0);
    }

    #[tokio::test]
    async fn test_summary_merge_uses_synthesizer() {
        let synth = Arc::new(ScriptedAgent::replying("Use postgres"));
        let fixture = Fixture::new()
            .agent("a", Arc::new(ScriptedAgent::replying("postgres")))
            .agent("b", Arc::new(ScriptedAgent::replying("mysql")))
            .agent("synth", synth.clone())
            .synthesizer("synth");

        let result = fixture
            .run(fork_join(&["a", "b"], MergeStrategy::Summary))
            .await
            .unwrap();
        assert_eq!(result.merged_output, "Use postgres");
        let inputs = synth.inputs();
        let prompt = &inputs[0];
        assert!(prompt.starts_with("Original prompt: Pick a database"));
        assert!(prompt.contains("Agent 2:\nmysql"));
        assert_eq!(result.cost.llm_calls, 3);
    }

    #[tokio::test]
    async fn test_vote_merge_tallies_ballots() {
        let fixture = Fixture::new()
            .agent("a", Arc::new(ScriptedAgent::replying("VOTE: postgres\nCONFIDENCE: 0.9")))
            .agent("b", Arc::new(ScriptedAgent::replying("VOTE: Postgres\nCONFIDENCE: 0.7")))
            .agent("c", Arc::new(ScriptedAgent::replying("VOTE: mysql\nCONFIDENCE: 0.8")));

        let result = fixture
            .run(fork_join(&["a", "b", "c"], MergeStrategy::Vote(VoteConfig::default())))
            .await
            .unwrap();
        assert_eq!(result.merged_output, "postgres");
        let PatternResult::ForkJoin(fj) = &result.pattern_result else {
            panic!("expected fork-join result");
        };
        let vote = fj.vote.as_ref().unwrap();
        assert!(vote.consensus_reached);
        assert_eq!(vote.tally.choices[0].votes, 2);
        assert!(vote.tie_break.is_none());
    }

    #[tokio::test]
    async fn test_vote_tie_goes_to_judge() {
        let judge = Arc::new(ScriptedAgent::replying("mysql."));
        let config = VoteConfig {
            strategy: VoteStrategy::Majority,
            tie_breaker: Some(id("judge")),
            ..VoteConfig::default()
        };
        let fixture = Fixture::new()
            .agent("a", Arc::new(ScriptedAgent::replying("VOTE: postgres")))
            .agent("b", Arc::new(ScriptedAgent::replying("VOTE: mysql")))
            .agent("judge", judge.clone());

        let result = fixture
            .run(fork_join(&["a", "b"], MergeStrategy::Vote(config)))
            .await
            .unwrap();
        assert_eq!(result.merged_output, "mysql");
        let PatternResult::ForkJoin(fj) = &result.pattern_result else {
            panic!("expected fork-join result");
        };
        let vote = fj.vote.as_ref().unwrap();
        assert_eq!(vote.tie_break, Some(TieBreak::Judge { agent_id: id("judge") }));
        assert!(!vote.consensus_reached);
        assert!(judge.inputs()[0].contains("- postgres"));
    }

    #[tokio::test]
    async fn test_vote_tie_without_judge_takes_first() {
        let fixture = Fixture::new()
            .agent("a", Arc::new(ScriptedAgent::replying("VOTE: postgres")))
            .agent("b", Arc::new(ScriptedAgent::replying("VOTE: mysql")));

        let result = fixture
            .run(fork_join(&["a", "b"], MergeStrategy::Vote(VoteConfig::default())))
            .await
            .unwrap();
        assert_eq!(result.merged_output, "postgres");
    }

    struct Longest;

    #[async_trait]
    impl Reducer for Longest {
        async fn reduce(&self, _prompt: &str, outputs: &[AgentOutput]) -> Result<String, String> {
            outputs
                .iter()
                .map(|o| o.output.clone())
                .max_by_key(String::len)
                .ok_or_else(|| "no outputs".to_string())
        }
    }

    #[tokio::test]
    async fn test_custom_reducer() {
        let fixture = Fixture::new()
            .agent("a", Arc::new(ScriptedAgent::replying("short")))
            .agent("b", Arc::new(ScriptedAgent::replying("much longer answer")))
            .reducer("longest", Arc::new(Longest));

        let result = fixture
            .run(fork_join(&["a", "b"], MergeStrategy::Custom("longest".into())))
            .await
            .unwrap();
        assert_eq!(result.merged_output, "much longer answer");
    }
}
