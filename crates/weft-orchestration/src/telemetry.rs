//! Optional Prometheus recording. Without the `metrics` feature, or without
//! a configured `WorkflowMetrics`, every call is a no-op.

use std::time::Duration;

use weft_core::Usage;
use weft_memory::GcReport;
use weft_mesh::PublishReceipt;

use crate::pattern::PatternKind;

#[cfg(feature = "metrics")]
use std::sync::Arc;
#[cfg(feature = "metrics")]
use tracing::debug;
#[cfg(feature = "metrics")]
use weft_observability::WorkflowMetrics;

#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<WorkflowMetrics>>,
}

#[cfg(feature = "metrics")]
impl Telemetry {
    pub(crate) fn with_metrics(metrics: Arc<WorkflowMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
        }
    }

    pub(crate) fn run(&self, pattern: PatternKind, status: &str, duration: Duration) {
        if let Some(metrics) = &self.metrics
            && let Err(e) = metrics.record_run(pattern.as_str(), status, duration)
        {
            debug!(error = %e, "Failed to record run metric");
        }
    }

    /// One agent invocation; `usage` is `None` when it failed.
    pub(crate) fn invocation(&self, usage: Option<&Usage>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.record_invocation(usage.is_some());
        if let Some(usage) = usage {
            metrics.record_usage(usage.cost_usd.max(0.0), usage.total_tokens());
        }
    }

    pub(crate) fn published(&self, receipt: &PublishReceipt) {
        self.bus("published", 1);
        self.bus("delivered", receipt.delivered as u64);
        self.bus("dropped", receipt.dropped as u64);
        // Non-critical drops are handed to the dead letter queue.
        self.bus("dead_lettered", receipt.dropped as u64);
    }

    fn bus(&self, outcome: &str, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(metrics) = &self.metrics
            && let Err(e) = metrics.record_bus(outcome, count)
        {
            debug!(error = %e, outcome, "Failed to record bus metric");
        }
    }

    pub(crate) fn gc(&self, report: &GcReport) {
        if let Some(metrics) = &self.metrics {
            metrics.record_gc(report.collected as u64);
        }
    }
}

#[cfg(not(feature = "metrics"))]
impl Telemetry {
    pub(crate) fn run(&self, _pattern: PatternKind, _status: &str, _duration: Duration) {}

    pub(crate) fn invocation(&self, _usage: Option<&Usage>) {}

    pub(crate) fn published(&self, _receipt: &PublishReceipt) {}

    pub(crate) fn gc(&self, _report: &GcReport) {}
}
