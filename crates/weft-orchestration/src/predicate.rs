//! Branch predicates of conditional patterns.

use regex::Regex;
use std::sync::Arc;

use weft_core::{AgentError, Judge, JudgeVerdict};

use crate::error::{OrchResult, OrchestrationError};

#[derive(Debug, Clone)]
pub enum BranchPredicate {
    /// Output equals the value, ignoring surrounding whitespace and case
    Equals(String),
    /// Output contains the value, ignoring case
    Contains(String),
    /// Output matches the regular expression
    Regex(Regex),
    /// A judge scores the output at or above `min_score`
    Judge { criteria: String, min_score: f64 },
}

impl PartialEq for BranchPredicate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Equals(a), Self::Equals(b)) | (Self::Contains(a), Self::Contains(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (
                Self::Judge {
                    criteria: a,
                    min_score: x,
                },
                Self::Judge {
                    criteria: b,
                    min_score: y,
                },
            ) => a == b && x == y,
            _ => false,
        }
    }
}

impl BranchPredicate {
    pub fn regex(pattern: &str) -> OrchResult<Self> {
        Regex::new(pattern)
            .map(BranchPredicate::Regex)
            .map_err(|e| OrchestrationError::invalid(format!("invalid branch regex: {e}")))
    }

    pub fn needs_judge(&self) -> bool {
        matches!(self, BranchPredicate::Judge { .. })
    }

    pub(crate) fn validate(&self) -> OrchResult<()> {
        if let BranchPredicate::Judge { min_score, .. } = self
            && !(0.0..=1.0).contains(min_score)
        {
            return Err(OrchestrationError::invalid(format!(
                "judge predicate min_score must be within 0.0..=1.0, got {min_score}"
            )));
        }
        Ok(())
    }

    /// Evaluate a textual predicate; `None` for a judged one.
    pub fn matches_text(&self, output: &str) -> Option<bool> {
        match self {
            BranchPredicate::Equals(expected) => Some(output.trim().eq_ignore_ascii_case(expected.trim())),
            BranchPredicate::Contains(needle) => Some(
                output
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
            ),
            BranchPredicate::Regex(re) => Some(re.is_match(output)),
            BranchPredicate::Judge { .. } => None,
        }
    }

    /// Whether a judge's verdict satisfies this predicate.
    pub fn accepts(&self, verdict: &JudgeVerdict) -> bool {
        match self {
            BranchPredicate::Judge { min_score, .. } => verdict.passed && verdict.score >= *min_score,
            _ => false,
        }
    }

    /// Evaluate against the condition agent's output. Judged predicates
    /// fail with `AgentError` when no judge is configured.
    pub async fn matches(
        &self,
        output: &str,
        judge: Option<&Arc<dyn Judge>>,
    ) -> Result<bool, AgentError> {
        if let Some(matched) = self.matches_text(output) {
            return Ok(matched);
        }
        let BranchPredicate::Judge { criteria, .. } = self else {
            return Ok(false);
        };
        let judge = judge.ok_or_else(|| AgentError::InvalidResponse("judged branch without a judge".to_string()))?;
        let verdict = judge.evaluate(criteria, output).await?;
        Ok(self.accepts(&verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use weft_testing::StaticJudge;

    #[rstest]
    #[case(BranchPredicate::Equals("sql".into()), "  SQL\n", true)]
    #[case(BranchPredicate::Equals("sql".into()), "nosql", false)]
    #[case(BranchPredicate::Contains("Python".into()), "use python here", true)]
    #[case(BranchPredicate::regex(r"^\d+$").unwrap(), "1234", true)]
    #[case(BranchPredicate::regex(r"^\d+$").unwrap(), "12a", false)]
    #[tokio::test]
    async fn test_textual_predicates(
        #[case] predicate: BranchPredicate,
        #[case] output: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(predicate.matches(output, None).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_judge_predicate() {
        let predicate = BranchPredicate::Judge {
            criteria: "is it urgent?".to_string(),
            min_score: 0.7,
        };
        let high: Arc<dyn Judge> = Arc::new(StaticJudge::passing(0.9));
        let low: Arc<dyn Judge> = Arc::new(StaticJudge::passing(0.5));
        assert!(predicate.matches("now", Some(&high)).await.unwrap());
        assert!(!predicate.matches("now", Some(&low)).await.unwrap());
        assert!(predicate.matches("now", None).await.is_err());
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(BranchPredicate::regex("(").is_err());
        assert!(
            BranchPredicate::Judge {
                criteria: String::new(),
                min_score: 2.0
            }
            .validate()
            .is_err()
        );
    }
}
