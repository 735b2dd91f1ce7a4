use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::load::{NodeLoad, SystemLoad};

/// Cluster bookkeeping consumed by the admission pipeline and the workflow
/// engine.
///
/// Implementors own job persistence and host capacity. The engine never
/// assumes it is the only writer: [`ServiceRegistry::update_job`] must reject
/// stale writes with [`RegistryError::StaleJob`].
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Name of the host this registry instance runs on.
    fn hostname(&self) -> String;

    /// Create and persist a job. Creator and organization are taken from the
    /// active [`crate::context::ExecutionContext`] when one is installed.
    async fn create_job(&self, request: NewJob) -> Result<Job, RegistryError>;

    /// Persist a modified job, returning the stored copy with its new version.
    async fn update_job(&self, job: Job) -> Result<Job, RegistryError>;

    /// Load the authoritative copy of a job.
    async fn get_job(&self, id: JobId) -> Result<Job, RegistryError>;

    /// Jobs whose parent is `parent`, in creation order.
    async fn child_jobs(&self, parent: JobId) -> Result<Vec<Job>, RegistryError>;

    /// Delete jobs. Unknown ids are ignored.
    async fn remove_jobs(&self, ids: &[JobId]) -> Result<(), RegistryError>;

    /// Number of jobs of `job_type` currently in `status`.
    async fn count(&self, job_type: &str, status: JobStatus) -> Result<u64, RegistryError>;

    /// Current aggregate load per host.
    async fn get_current_host_loads(
        &self,
        include_own_job_load: bool,
    ) -> Result<SystemLoad, RegistryError>;

    /// Configured maximum load of `host`.
    async fn get_max_load_on_node(&self, host: &str) -> Result<NodeLoad, RegistryError>;

    /// Maximum load of every registered host.
    async fn get_max_loads(&self) -> Result<SystemLoad, RegistryError>;
}

/// Severity attached to an incident.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Failure,
}

/// Sink for unrecoverable failures, kept for diagnostics.
#[async_trait]
pub trait IncidentSink: Send + Sync {
    async fn unhandled_exception(
        &self,
        job: &Job,
        severity: Severity,
        error: &(dyn std::error::Error + Send + Sync + 'static),
    );
}

/// Move a job to CANCELED unless it already reached a terminal state.
///
/// Concurrent writers are tolerated: a stale write reloads and tries again.
/// Returns whether this call performed the cancellation.
pub async fn cancel_job(registry: &dyn ServiceRegistry, id: JobId) -> Result<bool, RegistryError> {
    const ATTEMPTS: usize = 3;

    for _ in 0..ATTEMPTS {
        let mut job = registry.get_job(id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.set_status(JobStatus::Canceled);
        match registry.update_job(job).await {
            Ok(_) => return Ok(true),
            Err(RegistryError::StaleJob { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    let job = registry.get_job(id).await?;
    Err(RegistryError::StaleJob {
        job_id: id,
        expected: job.version,
        actual: job.version,
    })
}
