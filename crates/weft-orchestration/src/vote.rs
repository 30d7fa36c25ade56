//! Swarm voting: ballot parsing and tallying.
//!
//! Agents answer with
//!
//! ```text
//! VOTE: <choice>
//! CONFIDENCE: <0.0-1.0>
//! REASONING: <free text>
//! ```
//!
//! Missing fields default to an `abstain` vote at 0.5 confidence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use weft_core::AgentId;

use crate::error::{OrchResult, OrchestrationError};

pub const ABSTAIN: &str = "abstain";
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Rule deciding whether the leading choice carries the vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStrategy {
    /// More than half of the ballots
    #[default]
    Majority,
    /// At least two thirds of the ballots
    Supermajority,
    /// Every ballot
    Unanimous,
    /// Mean confidence of the winning ballots reaches the threshold
    Weighted,
    /// Summed confidence of the winner exceeds half the ballot count
    RankedChoice,
}

impl FromStr for VoteStrategy {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "majority" => Ok(VoteStrategy::Majority),
            "supermajority" => Ok(VoteStrategy::Supermajority),
            "unanimous" => Ok(VoteStrategy::Unanimous),
            "weighted" => Ok(VoteStrategy::Weighted),
            "ranked_choice" => Ok(VoteStrategy::RankedChoice),
            other => Err(OrchestrationError::InvalidWorkflow(format!(
                "unknown voting strategy '{other}'"
            ))),
        }
    }
}

impl fmt::Display for VoteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoteStrategy::Majority => "majority",
            VoteStrategy::Supermajority => "supermajority",
            VoteStrategy::Unanimous => "unanimous",
            VoteStrategy::Weighted => "weighted",
            VoteStrategy::RankedChoice => "ranked_choice",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteConfig {
    pub strategy: VoteStrategy,
    /// Used by [`VoteStrategy::Weighted`].
    pub confidence_threshold: f64,
    /// Agent asked to pick among tied choices.
    pub tie_breaker: Option<AgentId>,
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            strategy: VoteStrategy::Majority,
            confidence_threshold: 0.5,
            tie_breaker: None,
        }
    }
}

impl VoteConfig {
    pub(crate) fn validate(&self) -> OrchResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(OrchestrationError::invalid(format!(
                "vote confidence threshold must be within 0.0..=1.0, got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

/// One agent's parsed vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub agent_id: AgentId,
    pub choice: String,
    pub confidence: f64,
    pub reasoning: String,
}

impl Ballot {
    pub fn parse(agent_id: AgentId, text: &str) -> Self {
        let mut choice = None;
        let mut confidence = None;
        let mut reasoning = Vec::new();
        let mut in_reasoning = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = strip_label(trimmed, "VOTE:") {
                choice = Some(rest.to_string()).filter(|c| !c.is_empty());
                in_reasoning = false;
            } else if let Some(rest) = strip_label(trimmed, "CONFIDENCE:") {
                confidence = parse_confidence(rest);
                in_reasoning = false;
            } else if let Some(rest) = strip_label(trimmed, "REASONING:") {
                in_reasoning = true;
                if !rest.is_empty() {
                    reasoning.push(rest.to_string());
                }
            } else if in_reasoning && !trimmed.is_empty() {
                reasoning.push(trimmed.to_string());
            }
        }

        Self {
            agent_id,
            choice: choice.unwrap_or_else(|| ABSTAIN.to_string()),
            confidence: confidence.unwrap_or(DEFAULT_CONFIDENCE),
            reasoning: reasoning.join("\n"),
        }
    }
}

/// Case-insensitive `LABEL:` prefix match returning the trimmed remainder.
pub(crate) fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let head = line.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then(|| line[label.len()..].trim())
}

/// Accepts `0.8`, `80` and `80%`; values above 1 are read as percentages.
pub(crate) fn parse_confidence(raw: &str) -> Option<f64> {
    normalize_confidence(raw.trim().trim_end_matches('%').trim().parse().ok()?)
}

pub(crate) fn normalize_confidence(value: f64) -> Option<f64> {
    let value = if value > 1.0 { value / 100.0 } else { value };
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceTally {
    pub choice: String,
    pub votes: usize,
    pub confidence_sum: f64,
}

impl ChoiceTally {
    pub fn mean_confidence(&self) -> f64 {
        if self.votes == 0 {
            0.0
        } else {
            self.confidence_sum / self.votes as f64
        }
    }
}

/// Votes per choice, in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub choices: Vec<ChoiceTally>,
    pub ballots: usize,
}

impl Tally {
    pub fn count(ballots: &[Ballot]) -> Self {
        let mut choices: Vec<ChoiceTally> = Vec::new();
        for ballot in ballots {
            match choices
                .iter_mut()
                .find(|c| c.choice.eq_ignore_ascii_case(&ballot.choice))
            {
                Some(tally) => {
                    tally.votes += 1;
                    tally.confidence_sum += ballot.confidence;
                }
                None => choices.push(ChoiceTally {
                    choice: ballot.choice.clone(),
                    votes: 1,
                    confidence_sum: ballot.confidence,
                }),
            }
        }
        Self {
            choices,
            ballots: ballots.len(),
        }
    }

    /// Choices sharing the top score, in order of first appearance.
    pub fn leaders(&self, strategy: VoteStrategy) -> Vec<&ChoiceTally> {
        let score = |c: &ChoiceTally| match strategy {
            VoteStrategy::RankedChoice => c.confidence_sum,
            _ => c.votes as f64,
        };
        let best = self
            .choices
            .iter()
            .map(score)
            .fold(f64::NEG_INFINITY, f64::max);
        self.choices
            .iter()
            .filter(|c| (score(c) - best).abs() < f64::EPSILON)
            .collect()
    }

    /// Whether `winner` carries the vote under `config`.
    pub fn carries(&self, winner: &ChoiceTally, config: &VoteConfig) -> bool {
        let n = self.ballots;
        match config.strategy {
            VoteStrategy::Majority => winner.votes * 2 > n,
            VoteStrategy::Supermajority => winner.votes * 3 >= n * 2,
            VoteStrategy::Unanimous => winner.votes == n,
            VoteStrategy::Weighted => winner.mean_confidence() >= config.confidence_threshold,
            VoteStrategy::RankedChoice => winner.confidence_sum > n as f64 / 2.0,
        }
    }
}

/// How a tie among leading choices was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum TieBreak {
    Judge { agent_id: AgentId },
    /// Earliest choice to appear among the tied ones
    Order,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub winner: String,
    pub strategy: VoteStrategy,
    pub consensus_reached: bool,
    pub tally: Tally,
    pub ballots: Vec<Ballot>,
    pub tie_break: Option<TieBreak>,
}

/// Prompt asking the tie breaker to choose.
pub(crate) fn tie_break_prompt(question: &str, tied: &[&ChoiceTally], ballots: &[Ballot]) -> String {
    let mut prompt = format!("The vote on the following question is tied.\n\nQuestion: {question}\n\nTied choices:\n");
    for choice in tied {
        prompt.push_str(&format!("- {}\n", choice.choice));
    }
    prompt.push_str("\nBallots:\n");
    for ballot in ballots {
        prompt.push_str(&format!(
            "- {} voted {} (confidence {:.2}): {}\n",
            ballot.agent_id, ballot.choice, ballot.confidence, ballot.reasoning
        ));
    }
    prompt.push_str("\nRespond with exactly one of the tied choices and nothing else.");
    prompt
}

/// Pick the tied choice named by the tie breaker's reply.
pub(crate) fn match_tie_reply<'a>(reply: &str, tied: &[&'a ChoiceTally]) -> Option<&'a ChoiceTally> {
    let reply = reply.trim().trim_matches(|c: char| c == '"' || c == '.');
    let reply = strip_label(reply, "VOTE:").unwrap_or(reply);
    tied.iter()
        .find(|c| c.choice.eq_ignore_ascii_case(reply))
        .or_else(|| {
            let lower = reply.to_lowercase();
            tied.iter().find(|c| lower.contains(&c.choice.to_lowercase()))
        })
        .copied()
}

/// Instructions appended to a swarm question.
pub fn ballot_instructions() -> &'static str {
    "Respond in the following format:\n\
     VOTE: <your choice>\n\
     CONFIDENCE: <0.0 to 1.0>\n\
     REASONING: <why you chose it>"
}
