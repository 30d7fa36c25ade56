//! Scoring oracle consumed by judged branch predicates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub passed: bool,
    /// Normalised score in `0.0..=1.0`.
    pub score: f64,
}

/// Evaluates a response against the prompt that produced it.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, prompt: &str, response: &str) -> AgentResult<JudgeVerdict>;
}
