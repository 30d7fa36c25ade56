//! Debate positions, rounds and prompts.

use serde::{Deserialize, Serialize};

use weft_core::AgentId;

use crate::vote::{normalize_confidence, parse_confidence, strip_label};

const DEFAULT_CONFIDENCE: f64 = 0.75;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebatePosition {
    pub agent_id: AgentId,
    pub position: String,
    pub arguments: Vec<String>,
    /// `0.0..=1.0`
    pub confidence: f64,
    pub tools_used: Vec<String>,
}

impl DebatePosition {
    /// Parse a reply in either the `POSITION:/ARGUMENTS:/CONFIDENCE:` form or
    /// as a JSON object with `position`, `arguments` and `confidence`.
    /// Unstructured replies become the position verbatim.
    pub fn parse(agent_id: AgentId, text: &str, tools_used: Vec<String>) -> Self {
        let (position, arguments, confidence) =
            parse_json(text).unwrap_or_else(|| parse_labelled(text));
        Self {
            agent_id,
            position,
            arguments,
            confidence,
            tools_used,
        }
    }
}

fn parse_json(text: &str) -> Option<(String, Vec<String>, f64)> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    let object = value.as_object()?;
    let position = object.get("position")?.as_str()?.to_string();
    let arguments = object
        .get("arguments")
        .and_then(|a| a.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let confidence = match object.get("confidence") {
        Some(serde_json::Value::Number(n)) => n.as_f64().and_then(normalize_confidence),
        Some(serde_json::Value::String(s)) => parse_confidence(s),
        _ => None,
    }
    .unwrap_or(DEFAULT_CONFIDENCE);
    Some((position, arguments, confidence))
}

fn parse_labelled(text: &str) -> (String, Vec<String>, f64) {
    let mut position = String::new();
    let mut arguments = Vec::new();
    let mut confidence = DEFAULT_CONFIDENCE;
    let mut in_arguments = false;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = strip_label(line, "POSITION:") {
            position = rest.to_string();
            in_arguments = false;
        } else if strip_label(line, "ARGUMENTS:").is_some() {
            in_arguments = true;
        } else if let Some(rest) = strip_label(line, "CONFIDENCE:") {
            confidence = parse_confidence(rest).unwrap_or(confidence);
            in_arguments = false;
        } else if in_arguments && !line.is_empty() {
            let argument = line.trim_start_matches(|c: char| {
                c.is_ascii_digit() || matches!(c, '.' | '-' | '*' | '•' | ' ' | ')')
            });
            if !argument.is_empty() {
                arguments.push(argument.to_string());
            }
        }
    }

    if position.is_empty() {
        position = text.trim().to_string();
    }
    (position, arguments, confidence)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateRound {
    pub round_number: u32,
    pub positions: Vec<DebatePosition>,
    pub synthesis: String,
    pub consensus_reached: bool,
    /// Share of positions in the largest agreeing cluster
    pub agreement: f64,
}

impl DebateRound {
    fn summary(&self) -> String {
        let mut out = String::new();
        for position in &self.positions {
            out.push_str(&format!(
                "**Agent {}** (confidence: {:.0}%):\n{}\n",
                position.agent_id,
                position.confidence * 100.0,
                position.position
            ));
            for argument in &position.arguments {
                out.push_str(&format!("- {argument}\n"));
            }
            out.push('\n');
        }
        if !self.synthesis.is_empty() {
            out.push_str(&format!("**Synthesis**: {}\n", self.synthesis));
        }
        out
    }
}

/// Prompt for one participant in round `round`, carrying the transcript.
pub(crate) fn round_prompt(topic: &str, round: u32, history: &[DebateRound]) -> String {
    let mut prompt = format!("# Debate Topic\n\n{topic}\n\n# Round {round}\n\n");
    if history.is_empty() {
        prompt.push_str("This is the opening round. Present your initial position.\n\n");
    } else {
        prompt.push_str("## Previous Rounds\n\n");
        for previous in history {
            prompt.push_str(&format!(
                "### Round {}\n{}\n",
                previous.round_number,
                previous.summary()
            ));
        }
    }
    prompt.push_str(
        "Please provide your position on this topic. Structure your response as:\n\n\
         POSITION: [Your clear stance/conclusion]\n\n\
         ARGUMENTS:\n\
         1. [First supporting argument]\n\
         2. [Second supporting argument]\n\
         3. [Third supporting argument]\n\n\
         CONFIDENCE: [0-100]\n",
    );
    prompt
}

/// Prompt for the moderator closing round `round`.
pub(crate) fn synthesis_prompt(topic: &str, round: u32, positions: &[DebatePosition]) -> String {
    let mut prompt = format!(
        "You are moderating a debate on:\n\n{topic}\n\nThese are the positions from round {round}:\n\n"
    );
    for position in positions {
        prompt.push_str(&format!(
            "Agent {} (confidence {:.0}%):\nPOSITION: {}\n",
            position.agent_id,
            position.confidence * 100.0,
            position.position
        ));
        if !position.arguments.is_empty() {
            prompt.push_str("ARGUMENTS:\n");
            for argument in &position.arguments {
                prompt.push_str(&format!("- {argument}\n"));
            }
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Synthesize these positions into a single conclusion. Where agents disagree, \
         decide which view is better supported and say so.",
    );
    prompt
}
