//! Weft Observability
//!
//! Structured log setup and Prometheus metrics for workflow runs. Metric
//! label values come from small fixed sets (pattern kinds, run statuses,
//! delivery outcomes) so series cardinality stays bounded.

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "tracing")]
pub mod trace;

#[cfg(feature = "metrics")]
pub use metrics::{MetricsError, WorkflowMetrics};

#[cfg(feature = "tracing")]
pub use trace::{LogFormat, init_tracing};

/// Latency buckets for run durations, 5ms up to 10 minutes
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.05,  // 50ms
    0.25,  // 250ms
    1.0,   // 1s
    2.5,   // 2.5s
    5.0,   // 5s
    15.0,  // 15s
    60.0,  // 1m
    180.0, // 3m
    600.0, // 10m
];

/// Observability framework errors
#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[cfg(feature = "metrics")]
    #[error("Metrics error: {0}")]
    Metrics(#[from] metrics::MetricsError),
}
