//! Per-run cost accounting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use weft_core::{AgentId, Usage};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCost {
    pub cost_usd: f64,
    pub tokens: u64,
    pub calls: u64,
}

/// Cost and token totals of one run, broken down by agent.
///
/// Totals only grow: every invocation is recorded once, whether its output
/// survives into the final result or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub llm_calls: u64,
    pub by_agent: BTreeMap<String, AgentCost>,
}

impl CostSummary {
    pub fn record(&mut self, agent: &AgentId, usage: &Usage) {
        let cost = usage.cost_usd.max(0.0);
        let tokens = usage.total_tokens();
        self.total_cost_usd += cost;
        self.total_tokens += tokens;
        self.llm_calls += 1;

        let entry = self.by_agent.entry(agent.to_string()).or_default();
        entry.cost_usd += cost;
        entry.tokens += tokens;
        entry.calls += 1;
    }

    pub fn agent(&self, agent: &AgentId) -> Option<&AgentCost> {
        self.by_agent.get(agent.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_per_agent() {
        let mut summary = CostSummary::default();
        let a = AgentId::new_unchecked("a");
        let b = AgentId::new_unchecked("b");
        let usage = Usage {
            cost_usd: 0.25,
            input_tokens: 10,
            output_tokens: 5,
        };
        summary.record(&a, &usage);
        summary.record(&a, &usage);
        summary.record(&b, &Usage::default());

        assert_eq!(summary.llm_calls, 3);
        assert_eq!(summary.total_tokens, 30);
        assert!((summary.total_cost_usd - 0.5).abs() < 1e-9);
        assert_eq!(summary.agent(&a).unwrap().calls, 2);
        assert_eq!(summary.agent(&b).unwrap().tokens, 0);
    }

    #[test]
    fn test_negative_cost_is_ignored() {
        let mut summary = CostSummary::default();
        summary.record(
            &AgentId::new_unchecked("a"),
            &Usage {
                cost_usd: -1.0,
                ..Default::default()
            },
        );
        assert_eq!(summary.total_cost_usd, 0.0);
    }
}
