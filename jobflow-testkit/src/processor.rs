use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow::*;
use parking_lot::Mutex;

/// What a [`RecordingProcessor`] saw when it ran a job.
#[derive(Clone, Debug)]
pub struct ProcessedJob {
    pub job_id: JobId,
    /// Status of the job as handed to the processor.
    pub status: JobStatus,
    pub processing_host: Option<String>,
    pub context: Option<ExecutionContext>,
}

/// Processor that succeeds and records each call.
#[derive(Clone, Debug, Default)]
pub struct RecordingProcessor {
    calls: Arc<Mutex<Vec<ProcessedJob>>>,
    payload: Option<String>,
    delay: Option<Duration>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ProcessedJob> {
        self.calls.lock().clone()
    }

    pub fn assert_processed_count_eq(&self, expected: usize) {
        let actual = self.calls.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} processed jobs, got {}",
            expected, actual
        );
    }
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    async fn process(&self, job: &Job) -> Result<Option<String>, ProcessingError> {
        self.calls.lock().push(ProcessedJob {
            job_id: job.id,
            status: job.status,
            processing_host: job.processing_host.clone(),
            context: ExecutionContext::current(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.payload.clone())
    }
}

#[derive(Clone, Debug)]
enum Failure {
    Message(String),
    RegistryUnavailable,
    Canceled,
}

/// Processor that always fails in a configured way.
#[derive(Clone, Debug)]
pub struct FailingProcessor {
    failure: Failure,
}

impl FailingProcessor {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            failure: Failure::Message(message.into()),
        }
    }

    /// Fail with a registry outage.
    pub fn registry_unavailable() -> Self {
        Self {
            failure: Failure::RegistryUnavailable,
        }
    }

    /// Report the job as canceled.
    pub fn canceled() -> Self {
        Self {
            failure: Failure::Canceled,
        }
    }
}

#[async_trait]
impl JobProcessor for FailingProcessor {
    async fn process(&self, job: &Job) -> Result<Option<String>, ProcessingError> {
        Err(match &self.failure {
            Failure::Message(message) => ProcessingError::Other(anyhow::anyhow!("{message}")),
            Failure::RegistryUnavailable => {
                ProcessingError::Registry(RegistryError::Unavailable("processor".to_string()))
            }
            Failure::Canceled => ProcessingError::Canceled(job.id),
        })
    }
}

/// Processor that holds every job until released.
///
/// On release it reloads the job and reports a cancellation if someone
/// moved it to CANCELED in the meantime.
#[derive(Clone)]
pub struct GatedProcessor {
    registry: Arc<dyn ServiceRegistry>,
    gate: CancelToken,
    started: Arc<Mutex<Vec<JobId>>>,
}

impl std::fmt::Debug for GatedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatedProcessor")
            .field("released", &self.gate.is_cancelled())
            .field("started", &self.started.lock().len())
            .finish()
    }
}

impl GatedProcessor {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            gate: CancelToken::new(),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn release(&self) {
        self.gate.cancel();
    }

    pub fn started(&self) -> Vec<JobId> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl JobProcessor for GatedProcessor {
    async fn process(&self, job: &Job) -> Result<Option<String>, ProcessingError> {
        self.started.lock().push(job.id);
        self.gate.cancelled().await;

        let current = self.registry.get_job(job.id).await?;
        if current.status == JobStatus::Canceled {
            return Err(ProcessingError::Canceled(job.id));
        }
        Ok(None)
    }
}
