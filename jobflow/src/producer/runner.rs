use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{ProcessingError, RegistryError};
use crate::identity::IdentityDirectory;
use crate::job::{JobId, JobStatus};
use crate::registry::{IncidentSink, ServiceRegistry, Severity};
use crate::telemetry;

use super::controller::JobProcessor;

/// Background task owning one admitted job until its final state is
/// persisted.
pub(crate) struct JobRunner {
    pub(crate) job_id: JobId,
    pub(crate) job_type: String,
    pub(crate) operation: String,
    pub(crate) creator: String,
    pub(crate) organization: String,
    pub(crate) submitted_by: Option<JobId>,
    pub(crate) registry: Arc<dyn ServiceRegistry>,
    pub(crate) identity: Arc<dyn IdentityDirectory>,
    pub(crate) incidents: Arc<dyn IncidentSink>,
    pub(crate) processor: Arc<dyn JobProcessor>,
}

impl JobRunner {
    pub(crate) async fn run(self) -> Result<(), RegistryError> {
        let timing = telemetry::record_job_start(self.job_id.to_string());

        let context = match self.resolve_context().await {
            Ok(context) => context,
            Err(err) => {
                let result = self.handle_failure(err).await;
                telemetry::record_job_end(timing, &self.job_type, "failed");
                return result;
            }
        };

        let (result, outcome) = context
            .scope(async {
                match self.process().await {
                    Ok(payload) => (self.handle_success(payload).await, "finished"),
                    Err(err) if err.is_canceled() => {
                        tracing::info!(job_id = %self.job_id, "{err}");
                        (Ok(()), "canceled")
                    }
                    Err(err) => (self.handle_failure(err).await, "failed"),
                }
            })
            .await;

        telemetry::record_job_end(timing, &self.job_type, outcome);
        result
    }

    async fn resolve_context(&self) -> Result<ExecutionContext, ProcessingError> {
        let organization = self.identity.get_organization(&self.organization).await?;
        let user = self
            .identity
            .load_user(&self.creator, &organization.id)
            .await?;

        Ok(ExecutionContext::new(organization, user)
            .with_current_job(Some(self.job_id))
            .with_submitted_by(self.submitted_by))
    }

    async fn process(&self) -> Result<Option<String>, ProcessingError> {
        let job = self.registry.get_job(self.job_id).await?;
        tracing::debug!(
            job_id = %job.id,
            operation = %self.operation,
            "processing job"
        );
        self.processor.process(&job).await
    }

    async fn handle_success(&self, payload: Option<String>) -> Result<(), RegistryError> {
        let mut job = self.registry.get_job(self.job_id).await?;
        if job.status.is_terminal() {
            tracing::info!(
                job_id = %job.id,
                status = %job.status,
                "job reached a final state while running; keeping it"
            );
            return Ok(());
        }

        job.payload = payload;
        job.set_status(JobStatus::Finished);
        self.registry.update_job(job).await?;
        tracing::debug!(job_id = %self.job_id, "job finished");
        Ok(())
    }

    async fn handle_failure(&self, err: ProcessingError) -> Result<(), RegistryError> {
        if err.is_canceled() {
            tracing::info!(job_id = %self.job_id, "{err}");
            return Ok(());
        }

        tracing::error!(job_id = %self.job_id, error = %err, "job failed");

        let mut job = self.registry.get_job(self.job_id).await?;
        if !job.status.is_terminal() {
            job.set_status(JobStatus::Failed);
            job = self.registry.update_job(job).await?;
        }
        self.incidents
            .unhandled_exception(&job, Severity::Failure, &err)
            .await;

        match err {
            ProcessingError::Registry(source) => Err(source),
            _ => Ok(()),
        }
    }
}
