//! Mock judges

use async_trait::async_trait;
use std::sync::Mutex;

use weft_core::{AgentResult, Judge, JudgeVerdict};

type ScoreFn = Box<dyn Fn(&str, &str) -> f64 + Send + Sync>;

/// A judge with a fixed or computed verdict
pub struct StaticJudge {
    score: ScoreFn,
    threshold: f64,
    evaluated: Mutex<Vec<(String, String)>>,
}

impl StaticJudge {
    /// Always pass with the given score.
    pub fn passing(score: f64) -> Self {
        Self::scoring(move |_, _| score, f64::NEG_INFINITY)
    }

    /// Always fail with the given score.
    pub fn failing(score: f64) -> Self {
        Self::scoring(move |_, _| score, f64::INFINITY)
    }

    /// Score with `f(prompt, response)`; pass when the score reaches `threshold`.
    pub fn scoring(f: impl Fn(&str, &str) -> f64 + Send + Sync + 'static, threshold: f64) -> Self {
        Self {
            score: Box::new(f),
            threshold,
            evaluated: Mutex::new(Vec::new()),
        }
    }

    /// `(prompt, response)` pairs seen so far
    pub fn evaluated(&self) -> Vec<(String, String)> {
        self.evaluated.lock().unwrap().clone()
    }
}

#[async_trait]
impl Judge for StaticJudge {
    async fn evaluate(&self, prompt: &str, response: &str) -> AgentResult<JudgeVerdict> {
        self.evaluated
            .lock()
            .unwrap()
            .push((prompt.to_string(), response.to_string()));
        let score = (self.score)(prompt, response);
        Ok(JudgeVerdict {
            passed: score >= self.threshold,
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scoring_threshold() {
        let judge = StaticJudge::scoring(|_, response| response.len() as f64 / 10.0, 0.5);
        assert!(!judge.evaluate("p", "abc").await.unwrap().passed);
        let verdict = judge.evaluate("p", "abcdefgh").await.unwrap();
        assert!(verdict.passed);
        assert!((verdict.score - 0.8).abs() < f64::EPSILON);
        assert_eq!(judge.evaluated().len(), 2);
    }

    #[tokio::test]
    async fn test_fixed_verdicts() {
        assert!(StaticJudge::passing(0.1).evaluate("p", "r").await.unwrap().passed);
        assert!(!StaticJudge::failing(0.9).evaluate("p", "r").await.unwrap().passed);
    }
}
