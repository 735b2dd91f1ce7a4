use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::ProducerConfig;
use crate::context::ExecutionContext;
use crate::error::{AdmissionError, ProcessingError, RegistryError};
use crate::identity::IdentityDirectory;
use crate::job::{Job, JobStatus};
use crate::registry::{IncidentSink, ServiceRegistry};
use crate::telemetry;

use super::runner::JobRunner;

/// Join handle of a spawned job runner.
///
/// Resolves to the registry error that prevented the runner from reconciling
/// the job's final state, if any.
pub type RunnerHandle = JoinHandle<Result<(), RegistryError>>;

/// The work a producer performs for each admitted job.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Process `job`, returning an optional payload recorded on success.
    ///
    /// Return [`ProcessingError::Canceled`] when the job was canceled while
    /// running; the runner then leaves the job's state to the canceller.
    async fn process(&self, job: &Job) -> Result<Option<String>, ProcessingError>;
}

/// Object-safe view of a producer used by dispatchers.
#[async_trait]
pub trait JobAdmission: Send + Sync {
    fn job_type(&self) -> &str;

    fn host(&self) -> String;

    async fn is_ready_to_accept(&self, job: &Job) -> Result<bool, RegistryError>;

    /// Admit a job that passed [`JobAdmission::is_ready_to_accept`]. The
    /// runner is detached.
    async fn admit(&self, job: Job) -> Result<(), AdmissionError>;
}

/// Admission controller for a single job type on one node.
///
/// Decides whether the node has capacity for a job, persists the RUNNING
/// transition, and hands the job to a detached [`JobRunner`].
pub struct JobProducer<P: JobProcessor> {
    job_type: String,
    config: ProducerConfig,
    registry: Arc<dyn ServiceRegistry>,
    identity: Arc<dyn IdentityDirectory>,
    incidents: Arc<dyn IncidentSink>,
    processor: Arc<P>,
}

impl<P: JobProcessor> fmt::Debug for JobProducer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProducer")
            .field("job_type", &self.job_type)
            .field("config", &self.config)
            .field("processor_type", &type_name::<P>())
            .finish()
    }
}

impl<P: JobProcessor> JobProducer<P> {
    pub fn new(
        job_type: impl Into<String>,
        config: ProducerConfig,
        registry: Arc<dyn ServiceRegistry>,
        identity: Arc<dyn IdentityDirectory>,
        incidents: Arc<dyn IncidentSink>,
        processor: Arc<P>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            config,
            registry,
            identity,
            incidents,
            processor,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn processor(&self) -> Arc<P> {
        Arc::clone(&self.processor)
    }

    /// Host this producer admits jobs on.
    pub fn host(&self) -> String {
        self.config
            .host
            .clone()
            .unwrap_or_else(|| self.registry.hostname())
    }

    /// Number of jobs of this producer's type currently in `status`.
    pub async fn count_jobs(&self, status: JobStatus) -> Result<u64, RegistryError> {
        self.registry.count(&self.job_type, status).await
    }

    /// Whether the producer accepts jobs for `operation` at all. Every
    /// operation is accepted.
    pub fn is_ready_to_accept_jobs(&self, _operation: &str) -> bool {
        true
    }

    /// Decide whether this node has capacity for `job`.
    ///
    /// The job's load is assumed to already be included in the host's
    /// current load, because the dispatcher marks the job DISPATCHING on
    /// this host before asking.
    pub async fn is_ready_to_accept(&self, job: &Job) -> Result<bool, RegistryError> {
        if job.job_type != self.job_type {
            tracing::debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                producer_type = %self.job_type,
                "declining job of foreign type"
            );
            return Ok(false);
        }

        let host = self.host();
        let max_load = self.registry.get_max_load_on_node(&host).await?;
        let loads = self.registry.get_current_host_loads(true).await?;
        let current = loads.get(&host).map(|n| n.load_factor).unwrap_or(0.0);

        let accepted = self.config.load_policy().can_accept(
            current,
            job.job_load,
            max_load.load_factor,
            true,
        );

        telemetry::record_admission(
            &self.job_type,
            accepted,
            current,
            job.job_load,
            max_load.load_factor,
        );
        Ok(accepted)
    }

    /// Persist RUNNING for `job` and start processing it in the background.
    ///
    /// When the RUNNING transition cannot be persisted the job is left in its
    /// prior state and no runner is started.
    pub async fn accept_job(&self, mut job: Job) -> Result<RunnerHandle, AdmissionError> {
        let span = telemetry::admission_span(job.id, &job.job_type);
        let submitted_by = ExecutionContext::current_job_id();
        let job_id = job.id;

        job.set_status(JobStatus::Running);
        if job.processing_host.is_none() {
            job.processing_host = Some(self.host());
        }

        let running = match self.registry.update_job(job).instrument(span.clone()).await {
            Ok(running) => running,
            Err(source) => {
                span.in_scope(|| {
                    tracing::error!(%job_id, error = %source, "unable to persist RUNNING state")
                });
                return Err(AdmissionError::PersistRunning { job_id, source });
            }
        };

        let runner = JobRunner {
            job_id: running.id,
            job_type: running.job_type.clone(),
            operation: running.operation.clone(),
            creator: running.creator.clone(),
            organization: running.organization.clone(),
            submitted_by,
            registry: Arc::clone(&self.registry),
            identity: Arc::clone(&self.identity),
            incidents: Arc::clone(&self.incidents),
            processor: Arc::clone(&self.processor) as Arc<dyn JobProcessor>,
        };

        span.in_scope(|| tracing::debug!(%job_id, "job admitted"));
        let run_span = telemetry::job_run_span(running.id, &running.job_type, &running.operation);
        Ok(tokio::spawn(runner.run().instrument(run_span)))
    }
}

#[async_trait]
impl<P: JobProcessor> JobAdmission for JobProducer<P> {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn host(&self) -> String {
        JobProducer::host(self)
    }

    async fn is_ready_to_accept(&self, job: &Job) -> Result<bool, RegistryError> {
        JobProducer::is_ready_to_accept(self, job).await
    }

    async fn admit(&self, job: Job) -> Result<(), AdmissionError> {
        self.accept_job(job).await.map(|_detached| ())
    }
}
