//! Merge strategies for fanned-out outputs.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use weft_core::AgentId;

use crate::error::{OrchResult, OrchestrationError};
use crate::result::AgentOutput;
use crate::vote::VoteConfig;

/// How the outputs of a fork-join or parallel pattern become one output.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MergeStrategy {
    /// Every output under an `=== Agent <id> ===` header
    #[default]
    Concatenate,
    /// The first output in declaration order
    First,
    /// Synthesizer combines the strongest points of every output
    Consensus,
    /// Synthesizer picks the most convincing option
    Voting,
    /// Synthesizer writes a concise summary
    Summary,
    /// Synthesizer returns the highest quality response
    Best,
    /// Structured ballots tallied under a voting rule
    Vote(VoteConfig),
    /// Reducer registered on the orchestrator under this name
    Custom(String),
}

impl MergeStrategy {
    pub fn name(&self) -> &str {
        match self {
            MergeStrategy::Concatenate => "concatenate",
            MergeStrategy::First => "first",
            MergeStrategy::Consensus => "consensus",
            MergeStrategy::Voting => "voting",
            MergeStrategy::Summary => "summary",
            MergeStrategy::Best => "best",
            MergeStrategy::Vote(_) => "vote",
            MergeStrategy::Custom(name) => name,
        }
    }

    /// Whether the merge is performed by a synthesizer agent.
    pub fn needs_synthesizer(&self) -> bool {
        matches!(
            self,
            MergeStrategy::Consensus
                | MergeStrategy::Voting
                | MergeStrategy::Summary
                | MergeStrategy::Best
        )
    }

    pub fn tie_breaker(&self) -> Option<&AgentId> {
        match self {
            MergeStrategy::Vote(config) => config.tie_breaker.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn validate(&self) -> OrchResult<()> {
        match self {
            MergeStrategy::Vote(config) => config.validate(),
            MergeStrategy::Custom(name) if name.trim().is_empty() => Err(
                OrchestrationError::invalid("custom merge strategy requires a reducer name"),
            ),
            _ => Ok(()),
        }
    }

    /// Prompt handed to the synthesizer for LLM-backed strategies.
    pub(crate) fn synthesis_prompt(&self, original: &str, outputs: &[AgentOutput]) -> String {
        let mut prompt = format!("Original prompt: {original}\n\n");
        let (intro, label, closing) = match self {
            MergeStrategy::Voting => (
                "Review these responses and select the most compelling answer:",
                "Option",
                "Identify which option is most convincing and explain why.",
            ),
            MergeStrategy::Summary => (
                "Summarize these agent responses concisely:",
                "Agent",
                "Provide a concise summary highlighting key points and conclusions.",
            ),
            MergeStrategy::Best => (
                "Evaluate these responses and select the highest quality one:",
                "Response",
                "Select and return the best response based on clarity, accuracy, and depth.",
            ),
            _ => (
                "The following agents provided responses:",
                "Agent",
                "Synthesize these perspectives into a consensus view that incorporates the strongest points from each agent.",
            ),
        };
        prompt.push_str(intro);
        prompt.push_str("\n\n");
        for (i, output) in outputs.iter().enumerate() {
            prompt.push_str(&format!("{label} {}:\n{}\n\n", i + 1, output.output));
        }
        prompt.push_str(closing);
        prompt
    }
}

/// `=== Agent <id> ===` sections separated by blank lines.
pub fn concatenate(outputs: &[AgentOutput]) -> String {
    outputs
        .iter()
        .map(|o| format!("=== Agent {} ===\n{}", o.agent_id, o.output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Custom(name) => write!(f, "custom:{name}"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = OrchestrationError;

    /// Parse a strategy name. `vote` uses the default [`VoteConfig`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        if let Some(name) = s.trim().strip_prefix("custom:") {
            return Ok(MergeStrategy::Custom(name.trim().to_string()));
        }
        match normalized.as_str() {
            "" | "concatenate" => Ok(MergeStrategy::Concatenate),
            "first" => Ok(MergeStrategy::First),
            "consensus" => Ok(MergeStrategy::Consensus),
            "voting" => Ok(MergeStrategy::Voting),
            "summary" => Ok(MergeStrategy::Summary),
            "best" => Ok(MergeStrategy::Best),
            "vote" => Ok(MergeStrategy::Vote(VoteConfig::default())),
            other => Err(OrchestrationError::InvalidWorkflow(format!(
                "unknown merge strategy '{other}'"
            ))),
        }
    }
}

impl Serialize for MergeStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MergeStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Caller-supplied merge, registered on the orchestrator by name and
/// selected with `custom:<name>`.
#[async_trait]
pub trait Reducer: Send + Sync {
    /// Combine outputs (in declaration order) into the merged output.
    async fn reduce(&self, prompt: &str, outputs: &[AgentOutput]) -> Result<String, String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("concatenate", MergeStrategy::Concatenate)]
    #[case("FIRST", MergeStrategy::First)]
    #[case(" summary ", MergeStrategy::Summary)]
    #[case("custom:longest", MergeStrategy::Custom("longest".to_string()))]
    #[case("", MergeStrategy::Concatenate)]
    fn test_parse(#[case] input: &str, #[case] expected: MergeStrategy) {
        assert_eq!(input.parse::<MergeStrategy>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_strategy() {
        assert!(matches!(
            "median".parse::<MergeStrategy>(),
            Err(OrchestrationError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_concatenate_format() {
        let outputs = vec![
            AgentOutput::new(AgentId::new_unchecked("a"), "one"),
            AgentOutput::new(AgentId::new_unchecked("b"), "two"),
        ];
        assert_eq!(
            concatenate(&outputs),
            "=== Agent a ===\none\n\n=== Agent b ===\ntwo"
        );
    }

    #[test]
    fn test_synthesis_prompt_numbers_outputs() {
        let outputs = vec![
            AgentOutput::new(AgentId::new_unchecked("a"), "one"),
            AgentOutput::new(AgentId::new_unchecked("b"), "two"),
        ];
        let prompt = MergeStrategy::Best.synthesis_prompt("q?", &outputs);
        assert!(prompt.starts_with("Original prompt: q?"));
        assert!(prompt.contains("Response 2:\ntwo"));
        assert!(MergeStrategy::Best.needs_synthesizer());
        assert!(!MergeStrategy::First.needs_synthesizer());
    }

    #[test]
    fn test_display_roundtrip_for_custom() {
        let strategy = MergeStrategy::Custom("longest".to_string());
        assert_eq!(strategy.to_string(), "custom:longest");
    }
}
