//! Prometheus metrics instrumentation for jobflow.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `jobflow_admission_decisions_total` - Admission decisions per job type
//! - `jobflow_workflow_states_total` - Workflow state transitions
//! - `jobflow_operation_retries_total` - Operation retries per strategy
//!
//! ## Histograms
//! - `jobflow_job_duration_seconds` - Job execution duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for jobflow metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static ADMISSION_DECISIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "jobflow_admission_decisions_total",
            "Admission decisions by job type and outcome",
        ),
        &["job_type", "decision"],
    )
    .expect("metric creation failed")
});

pub static WORKFLOW_STATES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "jobflow_workflow_states_total",
            "Workflow state transitions by target state",
        ),
        &["state"],
    )
    .expect("metric creation failed")
});

pub static OPERATION_RETRIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "jobflow_operation_retries_total",
            "Operation retries by template and retry strategy",
        ),
        &["template", "strategy"],
    )
    .expect("metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "jobflow_job_duration_seconds",
            "Job execution time by type and outcome",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["job_type", "outcome"],
    )
    .expect("metric creation failed")
});

fn register_all(registry: &Registry) -> prometheus::Result<()> {
    for metric in [
        Box::new(ADMISSION_DECISIONS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(WORKFLOW_STATES_TOTAL.clone()),
        Box::new(OPERATION_RETRIES_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        match registry.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Initialize and register all metrics with the global registry.
///
/// Must run before [`gather_metrics`] reports anything. Safe to call more
/// than once.
pub fn init_metrics() -> anyhow::Result<()> {
    register_all(&REGISTRY).map_err(Into::into)
}

pub fn record_admission(job_type: &str, accepted: bool) {
    let decision = if accepted { "accepted" } else { "declined" };
    ADMISSION_DECISIONS_TOTAL
        .with_label_values(&[job_type, decision])
        .inc();
}

pub fn record_workflow_state(state: &str) {
    WORKFLOW_STATES_TOTAL.with_label_values(&[state]).inc();
}

pub fn record_operation_retry(template: &str, strategy: &str) {
    OPERATION_RETRIES_TOTAL
        .with_label_values(&[template, strategy])
        .inc();
}

pub fn observe_job_duration(job_type: &str, outcome: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_admission("encode", true);
        record_admission("encode", false);
        record_workflow_state("SUCCEEDED");
        record_operation_retry("encode", "retry");
        observe_job_duration("encode", "finished", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("jobflow_admission_decisions_total"));
        assert!(output.contains("jobflow_workflow_states_total"));
        assert!(output.contains("jobflow_operation_retries_total"));
        assert!(output.contains("jobflow_job_duration_seconds"));
    }
}
