//! Tracing and telemetry instrumentation for jobflow.
//!
//! Helpers for creating tracing spans and recording metrics during admission,
//! job execution and workflow advancement. All functions work both with and
//! without the `metrics` feature flag.
//!
//! # Example
//!
//! ```ignore
//! use jobflow::telemetry::{job_run_span, record_job_start, record_job_end};
//!
//! let span = job_run_span(job.id, &job.job_type, &job.operation);
//! let timing = record_job_start(job.id.to_string());
//! // ... process the job
//! record_job_end(timing, &job.job_type, "finished");
//! ```

use std::fmt::Display;

use tracing::{Span, info_span};

/// Span covering a producer's admission of a job.
#[must_use]
pub fn admission_span(job_id: impl Display, job_type: impl AsRef<str>) -> Span {
    info_span!(
        "jobflow.admission",
        job_id = %job_id,
        job_type = %job_type.as_ref(),
    )
}

/// Span covering a job runner from start to final state.
#[must_use]
pub fn job_run_span(
    job_id: impl Display,
    job_type: impl AsRef<str>,
    operation: impl AsRef<str>,
) -> Span {
    info_span!(
        "jobflow.run",
        job_id = %job_id,
        job_type = %job_type.as_ref(),
        operation = %operation.as_ref(),
    )
}

/// Span covering a workflow's advancement task.
#[must_use]
pub fn workflow_span(workflow_id: impl Display, template: impl AsRef<str>) -> Span {
    info_span!(
        "jobflow.workflow",
        workflow_id = %workflow_id,
        template = %template.as_ref(),
    )
}

/// Span covering one operation execution.
#[must_use]
pub fn operation_span(workflow_id: impl Display, template: impl AsRef<str>, index: usize) -> Span {
    info_span!(
        "jobflow.operation",
        workflow_id = %workflow_id,
        template = %template.as_ref(),
        index = index,
    )
}

/// Record an admission decision.
pub fn record_admission(
    job_type: impl AsRef<str>,
    accepted: bool,
    current_load: f32,
    job_load: f32,
    max_load: f32,
) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        accepted,
        current_load,
        job_load,
        max_load,
        "admission decision"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_admission(job_type.as_ref(), accepted);
}

/// Record a workflow entering `state`.
pub fn record_workflow_state(workflow_id: impl Display, state: impl AsRef<str>) {
    tracing::info!(
        workflow_id = %workflow_id,
        state = %state.as_ref(),
        "workflow state changed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_workflow_state(state.as_ref());
}

/// Record a failed operation being scheduled for another attempt.
pub fn record_operation_retry(
    workflow_id: impl Display,
    template: impl AsRef<str>,
    strategy: impl AsRef<str>,
    failed_attempts: u32,
) {
    tracing::warn!(
        workflow_id = %workflow_id,
        template = %template.as_ref(),
        strategy = %strategy.as_ref(),
        failed_attempts,
        "operation failed; retrying"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_operation_retry(template.as_ref(), strategy.as_ref());
}

/// Observe the duration of a job execution.
pub fn observe_job_duration(
    job_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::info!(
        job_type = %job_type.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs,
        "job completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(job_type.as_ref(), outcome.as_ref(), duration_secs);
}

/// Record the start of job execution for duration tracking.
///
/// Returns an opaque handle that should be passed to `record_job_end`.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of job execution and update duration metrics.
pub fn record_job_end(
    handle: JobTimingHandle,
    job_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    observe_job_duration(job_type, outcome, handle.start.elapsed().as_secs_f64());
}

/// Handle for tracking job execution duration.
///
/// This is an opaque type returned by `record_job_start` and consumed by `record_job_end`.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_subscriber(f: impl FnOnce()) {
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_span_names() {
        with_subscriber(|| {
            let span = admission_span("job-1", "encode");
            assert_eq!(span.metadata().unwrap().name(), "jobflow.admission");

            let span = job_run_span("job-1", "encode", "START_OPERATION");
            assert_eq!(span.metadata().unwrap().name(), "jobflow.run");

            let span = workflow_span("wf-1", "publish");
            assert_eq!(span.metadata().unwrap().name(), "jobflow.workflow");

            let span = operation_span("wf-1", "inspect", 0);
            assert_eq!(span.metadata().unwrap().name(), "jobflow.operation");
        });
    }

    #[test]
    fn test_job_timing_handle() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(handle.elapsed().as_millis() >= 5);
        record_job_end(handle, "encode", "finished");
    }

    #[test]
    fn test_recorders_without_subscriber() {
        record_admission("encode", true, 1.0, 1.0, 4.0);
        record_workflow_state("wf-1", "SUCCEEDED");
        record_operation_retry("wf-1", "encode", "retry", 1);
    }
}
