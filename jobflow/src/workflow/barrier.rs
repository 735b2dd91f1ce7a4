use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::OperationError;
use crate::job::{JobId, JobStatus};
use crate::producer::{DispatchStatus, JobDispatcher};
use crate::registry::ServiceRegistry;

/// Final states of the jobs a barrier waited on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BarrierResult {
    pub statuses: BTreeMap<JobId, JobStatus>,
}

impl BarrierResult {
    pub fn is_success(&self) -> bool {
        self.statuses.values().all(|s| *s == JobStatus::Finished)
    }

    /// First job that did not finish, if any.
    pub fn first_failure(&self) -> Option<(JobId, JobStatus)> {
        self.statuses
            .iter()
            .find(|(_, s)| **s != JobStatus::Finished)
            .map(|(id, s)| (*id, *s))
    }
}

/// Waits for a set of jobs to reach a terminal state.
///
/// Jobs still QUEUED are offered to the dispatcher again on every poll.
/// Waiting ends early with [`OperationError::Canceled`] when the cancel
/// token fires; the jobs themselves are not touched.
pub struct JobBarrier {
    registry: Arc<dyn ServiceRegistry>,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
    preferred_host: Option<String>,
    poll_interval: Duration,
    cancel: CancelToken,
}

impl fmt::Debug for JobBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobBarrier")
            .field("has_dispatcher", &self.dispatcher.is_some())
            .field("preferred_host", &self.preferred_host)
            .field("poll_interval", &self.poll_interval)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobBarrier {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        poll_interval: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            registry,
            dispatcher: None,
            preferred_host: None,
            poll_interval,
            cancel,
        }
    }

    pub fn with_dispatcher(
        mut self,
        dispatcher: Option<Arc<dyn JobDispatcher>>,
        preferred_host: Option<String>,
    ) -> Self {
        self.dispatcher = dispatcher;
        self.preferred_host = preferred_host;
        self
    }

    pub async fn wait_for(&self, jobs: &[JobId]) -> Result<BarrierResult, OperationError> {
        let mut result = BarrierResult::default();
        let mut pending: Vec<JobId> = jobs.to_vec();

        loop {
            if self.cancel.is_cancelled() {
                return Err(OperationError::Canceled);
            }

            let mut still_pending = Vec::with_capacity(pending.len());
            for id in pending {
                let job = self.registry.get_job(id).await?;
                if job.status.is_terminal() {
                    result.statuses.insert(id, job.status);
                    continue;
                }
                if matches!(job.status, JobStatus::Instantiated | JobStatus::Queued) {
                    if let Some(dispatcher) = &self.dispatcher {
                        match dispatcher.dispatch(job, self.preferred_host.as_deref()).await {
                            Ok(DispatchStatus::Accepted { host }) => {
                                tracing::debug!(job_id = %id, %host, "job dispatched");
                            }
                            Ok(status) => {
                                tracing::trace!(job_id = %id, ?status, "job not dispatched yet");
                            }
                            Err(err) => {
                                tracing::warn!(job_id = %id, error = %err, "dispatch failed");
                            }
                        }
                    }
                }
                still_pending.push(id);
            }
            pending = still_pending;

            if pending.is_empty() {
                return Ok(result);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(OperationError::Canceled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
