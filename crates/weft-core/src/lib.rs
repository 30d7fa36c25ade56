//! # Weft Core
//!
//! Identifiers, immutable configuration and the capability traits shared by
//! the Weft crates:
//!
//! - [`Agent`] is the chat capability the orchestrator drives; [`AgentHandle`]
//!   wraps it with identity and busy/idle tracking.
//! - [`Tool`] is what gets injected into agents (bus publishing, shared
//!   memory access, restart signalling).
//! - [`Judge`] scores responses for judged conditional branches.
//! - [`WeftConfig`] is built once and passed by reference into constructors.

pub mod agent;
pub mod config;
pub mod error;
pub mod judge;
pub mod tool;
pub mod types;

pub use agent::{Agent, AgentHandle, AgentState, ChatResponse, Usage};
pub use config::{
    AutoPromoteConfig, BusConfig, CommunicationConfig, DeadLetterConfig, GcConfig, GcStrategy,
    OrchestratorConfig, OverflowConfig, SharedMemoryConfig, TierPolicyConfig, TopicClassPolicy,
    WeftConfig,
};
pub use error::{AgentError, AgentResult, ConfigError, ToolError, ToolResult};
pub use judge::{Judge, JudgeVerdict};
pub use tool::{Tool, ToolExecution};
pub use types::{AgentId, IdValidationError, SessionId, Topic, TopicPattern};
