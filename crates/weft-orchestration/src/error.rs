//! Error types for pattern validation and execution.
//!
//! Errors fall in four classes: configuration problems found before any
//! agent runs ([`OrchestrationError::is_configuration`]), agent failures,
//! bus/store failures (always located with a [`Step`]) and interruption
//! (cancellation or timeout), which may carry the partial result.

use std::fmt;
use thiserror::Error;

use weft_core::{AgentError, AgentId, ConfigError};
use weft_memory::MemoryError;
use weft_mesh::MeshError;

use crate::result::WorkflowResult;

/// Where inside a run a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A debate round (1-based)
    Round(u32),
    /// The synthesis at the end of a debate round
    Synthesis(u32),
    /// A fork-join branch (1-based)
    Branch(usize),
    /// A pipeline stage (1-based)
    Stage(usize, AgentId),
    /// A parallel task (1-based)
    Task(usize, AgentId),
    /// The condition evaluation of a conditional pattern
    Condition,
    /// An iteration of an iterative pattern (1-based)
    Iteration(u32),
    /// Merging fanned-out outputs
    Merge,
    /// Restart coordination
    Restart,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Round(n) => write!(f, "round {n}"),
            Step::Synthesis(n) => write!(f, "synthesis of round {n}"),
            Step::Branch(n) => write!(f, "branch {n}"),
            Step::Stage(n, agent) => write!(f, "stage {n} ({agent})"),
            Step::Task(n, agent) => write!(f, "task {n} ({agent})"),
            Step::Condition => f.write_str("condition"),
            Step::Iteration(n) => write!(f, "iteration {n}"),
            Step::Merge => f.write_str("merge"),
            Step::Restart => f.write_str("restart"),
        }
    }
}

/// Errors raised while validating or executing a workflow pattern.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    // ========================================================================
    // Configuration (fatal before execution, never retried)
    // ========================================================================
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Unsupported pattern type: {0}")]
    UnsupportedPattern(String),

    #[error("Workflow file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid YAML: {0}")]
    InvalidYaml(String),

    /// Iterative patterns need every participant to hold the restart tool.
    #[error("Restart tools missing for agents: {}", join_ids(.agents))]
    MissingRestartTools { agents: Vec<AgentId> },

    #[error("Pattern graph contains a cycle through pattern {0}")]
    PatternCycle(usize),

    #[error("Unknown reducer: {0}")]
    UnknownReducer(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Agent failed at {step}: {source}")]
    Agent {
        step: Step,
        #[source]
        source: AgentError,
    },

    #[error("Bus failure at {step}: {source}")]
    Bus {
        step: Step,
        #[source]
        source: MeshError,
    },

    #[error("Memory failure at {step}: {source}")]
    Memory {
        step: Step,
        #[source]
        source: MemoryError,
    },

    #[error("No branch matched condition output '{output}' and no default branch is set")]
    NoBranchMatched { output: String },

    #[error("All {failed} parallel tasks failed")]
    AllTasksFailed { failed: usize },

    #[error("Custom reducer '{name}' failed: {reason}")]
    ReducerFailed { name: String, reason: String },

    // ========================================================================
    // Interruption
    // ========================================================================
    #[error("Run cancelled")]
    Cancelled { partial: Option<Box<WorkflowResult>> },

    #[error("Run timed out")]
    TimedOut { partial: Option<Box<WorkflowResult>> },
}

fn join_ids(ids: &[AgentId]) -> String {
    ids.iter()
        .map(AgentId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl OrchestrationError {
    pub(crate) fn agent(step: Step, source: AgentError) -> Self {
        OrchestrationError::Agent { step, source }
    }

    pub(crate) fn bus(step: Step, source: MeshError) -> Self {
        OrchestrationError::Bus { step, source }
    }

    pub(crate) fn memory(step: Step, source: MemoryError) -> Self {
        OrchestrationError::Memory { step, source }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        OrchestrationError::InvalidPattern(reason.into())
    }

    /// Whether the error was detected before anything ran.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OrchestrationError::AgentNotFound(_)
                | OrchestrationError::InvalidWorkflow(_)
                | OrchestrationError::UnsupportedPattern(_)
                | OrchestrationError::FileNotFound(_)
                | OrchestrationError::InvalidYaml(_)
                | OrchestrationError::MissingRestartTools { .. }
                | OrchestrationError::PatternCycle(_)
                | OrchestrationError::UnknownReducer(_)
                | OrchestrationError::InvalidPattern(_)
                | OrchestrationError::Config(_)
        )
    }

    /// Whether the run ended because it was cancelled or timed out.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Cancelled { .. } | OrchestrationError::TimedOut { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::Agent { source, .. } => source.is_retryable(),
            OrchestrationError::Bus { source, .. } => source.is_retryable(),
            OrchestrationError::Memory { source, .. } => source.is_retryable(),
            OrchestrationError::TimedOut { .. } => true,
            _ => false,
        }
    }

    /// The step the failure is attributed to, for execution errors.
    pub fn step(&self) -> Option<&Step> {
        match self {
            OrchestrationError::Agent { step, .. }
            | OrchestrationError::Bus { step, .. }
            | OrchestrationError::Memory { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Partial result carried by an interrupted run.
    pub fn partial(&self) -> Option<&WorkflowResult> {
        match self {
            OrchestrationError::Cancelled { partial } | OrchestrationError::TimedOut { partial } => {
                partial.as_deref()
            }
            _ => None,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestrationError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            OrchestrationError::InvalidWorkflow(_) => "INVALID_WORKFLOW",
            OrchestrationError::UnsupportedPattern(_) => "UNSUPPORTED_PATTERN",
            OrchestrationError::FileNotFound(_) => "FILE_NOT_FOUND",
            OrchestrationError::InvalidYaml(_) => "INVALID_YAML",
            OrchestrationError::MissingRestartTools { .. } => "MISSING_RESTART_TOOLS",
            OrchestrationError::PatternCycle(_) => "PATTERN_CYCLE",
            OrchestrationError::UnknownReducer(_) => "UNKNOWN_REDUCER",
            OrchestrationError::InvalidPattern(_) => "INVALID_PATTERN",
            OrchestrationError::Config(_) => "INVALID_CONFIG",
            OrchestrationError::Agent { source, .. } => source.error_code(),
            OrchestrationError::Bus { source, .. } => source.error_code(),
            OrchestrationError::Memory { source, .. } => source.error_code(),
            OrchestrationError::NoBranchMatched { .. } => "NO_BRANCH_MATCHED",
            OrchestrationError::AllTasksFailed { .. } => "ALL_TASKS_FAILED",
            OrchestrationError::ReducerFailed { .. } => "REDUCER_FAILED",
            OrchestrationError::Cancelled { .. } => "CANCELLED",
            OrchestrationError::TimedOut { .. } => "TIMED_OUT",
        }
    }
}

/// Result type for orchestration operations.
pub type OrchResult<T> = Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_located_display() {
        let err = OrchestrationError::agent(
            Step::Stage(2, AgentId::new_unchecked("writer")),
            AgentError::InvocationFailed("upstream 500".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Agent failed at stage 2 (writer): Invocation failed: upstream 500"
        );
        assert_eq!(err.error_code(), "INVOCATION_FAILED");
        assert!(err.is_retryable());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(OrchestrationError::AgentNotFound(AgentId::new_unchecked("x")).is_configuration());
        assert!(
            OrchestrationError::MissingRestartTools {
                agents: vec![AgentId::new_unchecked("a"), AgentId::new_unchecked("b")]
            }
            .to_string()
            .ends_with("a, b")
        );
        assert!(!OrchestrationError::AllTasksFailed { failed: 3 }.is_configuration());
    }

    #[test]
    fn test_interrupted_carries_no_partial_by_default() {
        let err = OrchestrationError::Cancelled { partial: None };
        assert!(err.is_interrupted());
        assert!(err.partial().is_none());
        assert_eq!(err.error_code(), "CANCELLED");
    }
}
