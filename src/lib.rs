//! # Weft
//!
//! Multi-agent workflow orchestration over a tiered communication
//! substrate.
//!
//! This crate re-exports the workspace crates under one roof:
//!
//! - [`core`]: identifiers, configuration and the `Agent`, `Tool` and
//!   `Judge` capabilities
//! - [`memory`]: the reference store and shared memory
//! - [`mesh`]: the message bus
//! - [`orchestration`]: workflow patterns and the [`Orchestrator`]
//! - [`observability`]: tracing setup and Prometheus metrics (feature
//!   `observability`)

pub use weft_core as core;
pub use weft_memory as memory;
pub use weft_mesh as mesh;
pub use weft_orchestration as orchestration;

#[cfg(feature = "observability")]
pub use weft_observability as observability;

pub use weft_core::{Agent, AgentHandle, AgentId, Judge, SessionId, Tool, Topic, WeftConfig};
pub use weft_orchestration::{
    MergeStrategy, OrchestrationError, Orchestrator, PatternTable, RunOptions, WorkflowDocument,
    WorkflowPattern, WorkflowResult,
};
