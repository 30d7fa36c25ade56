//! Workflow metrics
//!
//! Every [`WorkflowMetrics`] owns its own Prometheus registry, so several
//! orchestrators (or tests) in one process never collide on metric names.

use prometheus::{
    Counter, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use thiserror::Error;

use crate::LATENCY_BUCKETS;

/// Run statuses used as the `status` label
pub const RUN_STATUSES: &[&str] = &["succeeded", "failed", "cancelled", "timed_out"];

/// Delivery outcomes used as the `outcome` label
pub const BUS_OUTCOMES: &[&str] = &["published", "delivered", "dropped", "dead_lettered"];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Invalid label value '{value}' for {label}")]
    InvalidLabel { label: &'static str, value: String },

    #[error("Failed to encode metrics: {0}")]
    Encoding(String),
}

/// Counters and histograms for workflow execution
#[derive(Debug, Clone)]
pub struct WorkflowMetrics {
    registry: Registry,
    runs_total: IntCounterVec,
    run_duration_seconds: HistogramVec,
    agent_invocations_total: IntCounterVec,
    llm_cost_usd_total: Counter,
    llm_tokens_total: IntCounter,
    bus_messages_total: IntCounterVec,
    reference_gc_collected_total: IntCounter,
}

impl WorkflowMetrics {
    pub fn new(namespace: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let runs_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_workflow_runs_total"),
                "Workflow runs by pattern and final status",
            ),
            &["pattern", "status"],
        )?;
        let run_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{namespace}_workflow_duration_seconds"),
                "Workflow run duration in seconds by pattern",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["pattern"],
        )?;
        let agent_invocations_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_agent_invocations_total"),
                "Agent invocations by outcome",
            ),
            &["status"],
        )?;
        let llm_cost_usd_total = Counter::new(
            format!("{namespace}_llm_cost_usd_total"),
            "Accumulated LLM cost in US dollars",
        )?;
        let llm_tokens_total = IntCounter::new(
            format!("{namespace}_llm_tokens_total"),
            "Accumulated LLM tokens, input and output",
        )?;
        let bus_messages_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_bus_messages_total"),
                "Bus messages by delivery outcome",
            ),
            &["outcome"],
        )?;
        let reference_gc_collected_total = IntCounter::new(
            format!("{namespace}_reference_gc_collected_total"),
            "References removed by garbage collection",
        )?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(run_duration_seconds.clone()))?;
        registry.register(Box::new(agent_invocations_total.clone()))?;
        registry.register(Box::new(llm_cost_usd_total.clone()))?;
        registry.register(Box::new(llm_tokens_total.clone()))?;
        registry.register(Box::new(bus_messages_total.clone()))?;
        registry.register(Box::new(reference_gc_collected_total.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            run_duration_seconds,
            agent_invocations_total,
            llm_cost_usd_total,
            llm_tokens_total,
            bus_messages_total,
            reference_gc_collected_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished run. `status` must be one of [`RUN_STATUSES`].
    pub fn record_run(
        &self,
        pattern: &str,
        status: &str,
        duration: std::time::Duration,
    ) -> Result<(), MetricsError> {
        if !RUN_STATUSES.contains(&status) {
            return Err(MetricsError::InvalidLabel {
                label: "status",
                value: status.to_string(),
            });
        }
        self.runs_total.with_label_values(&[pattern, status]).inc();
        self.run_duration_seconds
            .with_label_values(&[pattern])
            .observe(duration.as_secs_f64());
        Ok(())
    }

    pub fn record_invocation(&self, succeeded: bool) {
        let status = if succeeded { "succeeded" } else { "failed" };
        self.agent_invocations_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn record_usage(&self, cost_usd: f64, tokens: u64) {
        // Counter::inc_by panics on negative input
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.llm_cost_usd_total.inc_by(cost_usd);
        }
        self.llm_tokens_total.inc_by(tokens);
    }

    /// Record bus traffic. `outcome` must be one of [`BUS_OUTCOMES`].
    pub fn record_bus(&self, outcome: &str, count: u64) -> Result<(), MetricsError> {
        if !BUS_OUTCOMES.contains(&outcome) {
            return Err(MetricsError::InvalidLabel {
                label: "outcome",
                value: outcome.to_string(),
            });
        }
        if count > 0 {
            self.bus_messages_total
                .with_label_values(&[outcome])
                .inc_by(count);
        }
        Ok(())
    }

    pub fn record_gc(&self, collected: u64) {
        self.reference_gc_collected_total.inc_by(collected);
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
