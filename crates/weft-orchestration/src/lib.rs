//! # Weft Orchestration
//!
//! Multi-agent workflow patterns and the [`Orchestrator`] that runs them.
//!
//! A workflow is a [`PatternTable`] of [`WorkflowPattern`]s: debate,
//! fork-join, pipeline, parallel, conditional and iterative. Conditional
//! and iterative patterns nest other patterns by [`PatternId`]. Every run
//! returns a [`WorkflowResult`] with the merged output, the accumulated
//! cost and a pattern-specific result, or an [`OrchestrationError`]
//! locating the failed step.
//!
//! Agent invocations across all concurrent runs share one
//! [`ConcurrencyLimiter`]. Registered agents get communication tools
//! (publish/receive on the bus, shared memory read/write, restart signals)
//! bound to the run they are part of.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_core::{AgentId, WeftConfig};
//! use weft_orchestration::Orchestrator;
//! # use weft_core::Agent;
//! # async fn demo(writer: Arc<dyn Agent>) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(WeftConfig::default())?;
//! orchestrator.register_agent(AgentId::parse("writer")?, writer);
//!
//! let document = orchestrator.validate_workflow(
//!     r#"
//! apiVersion: weft/v1
//! kind: Workflow
//! metadata:
//!   name: essay
//! spec:
//!   type: pipeline
//!   initial_prompt: Write about rivers
//!   stages:
//!     - agent_id: writer
//! "#,
//! )?;
//! let result = orchestrator.execute_workflow(&document, Default::default()).await?;
//! println!("{} (${:.4})", result.merged_output, result.cost.total_cost_usd);
//! # Ok(())
//! # }
//! ```

pub mod agreement;
pub mod cost;
pub mod debate;
pub mod error;
mod executor;
pub mod library;
pub mod limiter;
pub mod merge;
pub mod orchestrator;
pub mod pattern;
pub mod predicate;
pub mod progress;
pub mod result;
mod telemetry;
pub mod template;
pub mod tools;
pub mod vote;
pub mod workflow;

pub use agreement::{AgreementCheck, JaccardAgreement};
pub use cost::{AgentCost, CostSummary};
pub use debate::{DebatePosition, DebateRound};
pub use error::{OrchResult, OrchestrationError, Step};
pub use executor::{RunOptions, stage_output_key};
pub use library::{PatternLibrary, PatternUpdateEvent, ScanReport};
pub use limiter::{ConcurrencyLimiter, InvocationPermit};
pub use merge::{MergeStrategy, Reducer};
pub use orchestrator::Orchestrator;
pub use pattern::{
    ConditionalBranch, ConditionalPattern, DebatePattern, ForkJoinPattern, IterativePattern,
    ParallelPattern, ParallelTask, PatternId, PatternKind, PatternTable, PipelinePattern,
    PipelineStage, RestartPolicy, WorkflowPattern,
};
pub use predicate::BranchPredicate;
pub use progress::ProgressEvent;
pub use result::{
    AgentOutput, ConditionalResult, DebateResult, ForkJoinResult, IterationRecord,
    IterativeResult, ParallelResult, PartialResult, PatternResult, PipelineResult,
    SelectedBranch, StageOutput, TaskOutcome, TaskStatus, WorkflowResult,
};
pub use template::InputMapping;
pub use tools::{RestartResponse, RestartSignal, restart_response_topic};
pub use vote::{Ballot, Tally, TieBreak, VoteConfig, VoteOutcome, VoteStrategy};
pub use workflow::{WorkflowDocument, WorkflowMetadata};
