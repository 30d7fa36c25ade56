//! Results of pattern execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use weft_core::{AgentId, ChatResponse, Usage};

use crate::cost::CostSummary;
use crate::debate::DebateRound;
use crate::pattern::PatternKind;
use crate::tools::RestartSignal;
use crate::vote::VoteOutcome;

/// One agent invocation's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: AgentId,
    pub output: String,
    pub tools_used: Vec<String>,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub duration_ms: u64,
}

impl AgentOutput {
    pub fn new(agent_id: AgentId, output: impl Into<String>) -> Self {
        Self {
            agent_id,
            output: output.into(),
            tools_used: Vec::new(),
            usage: Usage::default(),
            model: None,
            duration_ms: 0,
        }
    }

    pub(crate) fn from_response(agent_id: AgentId, response: ChatResponse, duration_ms: u64) -> Self {
        Self {
            agent_id,
            tools_used: response.tools_used(),
            output: response.content,
            usage: response.usage,
            model: response.model,
            duration_ms,
        }
    }
}

/// Output of a pipeline stage (1-based).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: usize,
    pub output: AgentOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded { output: AgentOutput },
    Failed { code: String, message: String },
}

/// Outcome of one parallel task, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// 1-based task index
    pub index: usize,
    pub agent_id: AgentId,
    pub metadata: BTreeMap<String, String>,
    #[serde(flatten)]
    pub status: TaskStatus,
}

impl TaskOutcome {
    pub fn output(&self) -> Option<&AgentOutput> {
        match &self.status {
            TaskStatus::Succeeded { output } => Some(output),
            TaskStatus::Failed { .. } => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded { .. })
    }
}

// ============================================================================
// Pattern-specific results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateResult {
    pub rounds: Vec<DebateRound>,
    pub consensus_achieved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkJoinResult {
    /// Branch outputs in declaration order
    pub outputs: Vec<AgentOutput>,
    pub merge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<VoteOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub stages: Vec<StageOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelResult {
    pub tasks: Vec<TaskOutcome>,
    pub merge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<VoteOutcome>,
}

impl ParallelResult {
    pub fn failed(&self) -> usize {
        self.tasks.iter().filter(|t| !t.succeeded()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum SelectedBranch {
    /// 1-based index among the declared branches
    Branch(usize),
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalResult {
    pub condition_output: AgentOutput,
    pub selected: SelectedBranch,
    pub branch: Box<PatternResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based
    pub iteration: u32,
    pub result: PatternResult,
    /// Restart signal accepted after this iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartSignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterativeResult {
    pub iterations: Vec<IterationRecord>,
}

/// What an interrupted run had finished before it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub completed: Vec<AgentOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum PatternResult {
    Debate(DebateResult),
    ForkJoin(ForkJoinResult),
    Pipeline(PipelineResult),
    Parallel(ParallelResult),
    Conditional(ConditionalResult),
    Iterative(IterativeResult),
    Partial(PartialResult),
}

/// Result of one workflow run. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub pattern: PatternKind,
    pub merged_output: String,
    pub cost: CostSummary,
    pub models_used: BTreeSet<String>,
    pub pattern_result: PatternResult,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowResult {
    /// Whether a debate ended in consensus; `None` for other patterns.
    pub fn consensus_achieved(&self) -> Option<bool> {
        match &self.pattern_result {
            PatternResult::Debate(debate) => Some(debate.consensus_achieved),
            _ => None,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.pattern_result, PatternResult::Partial(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::ToolExecution;

    #[test]
    fn test_output_from_response() {
        let response = ChatResponse {
            content: "done".to_string(),
            tool_executions: vec![ToolExecution {
                tool_name: "publish_message".to_string(),
                input: serde_json::json!({}),
                output: None,
                error: None,
            }],
            usage: Usage {
                cost_usd: 0.1,
                input_tokens: 3,
                output_tokens: 4,
            },
            model: Some("m1".to_string()),
        };
        let output = AgentOutput::from_response(AgentId::new_unchecked("a"), response, 12);
        assert_eq!(output.output, "done");
        assert_eq!(output.tools_used, vec!["publish_message"]);
        assert_eq!(output.usage.total_tokens(), 7);
        assert_eq!(output.model.as_deref(), Some("m1"));
        assert_eq!(output.duration_ms, 12);
    }

    #[test]
    fn test_task_outcome_serialization() {
        let failed = TaskOutcome {
            index: 2,
            agent_id: AgentId::new_unchecked("b"),
            metadata: BTreeMap::new(),
            status: TaskStatus::Failed {
                code: "TIMEOUT".to_string(),
                message: "too slow".to_string(),
            },
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["code"], "TIMEOUT");
        assert!(!failed.succeeded());
        assert!(failed.output().is_none());
    }
}
