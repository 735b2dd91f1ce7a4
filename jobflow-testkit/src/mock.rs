use std::sync::Arc;

use async_trait::async_trait;
use jobflow::*;
use parking_lot::Mutex;

/// Dispatcher that records every offer instead of routing it.
///
/// With a registry attached, accepted jobs are completed immediately on the
/// accepting host, as if a remote producer had run them.
#[derive(Clone)]
pub struct MockDispatcher {
    dispatches: Arc<Mutex<Vec<DispatchRecord>>>,
    result: Arc<Mutex<DispatchStatus>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub preferred_host: Option<String>,
}

impl std::fmt::Debug for MockDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDispatcher")
            .field("dispatches", &self.dispatches.lock().len())
            .field("result", &*self.result.lock())
            .field("completing", &self.registry.is_some())
            .finish()
    }
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::with_result(DispatchStatus::Accepted {
            host: "localhost".to_string(),
        })
    }

    pub fn with_result(result: DispatchStatus) -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            result: Arc::new(Mutex::new(result)),
            registry: None,
        }
    }

    /// Finish accepted jobs in `registry`.
    pub fn completing(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn record(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatches.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} dispatches, got {}",
            expected, actual
        );
    }

    pub fn set_result(&self, result: DispatchStatus) {
        *self.result.lock() = result;
    }

    pub fn clear(&self) {
        self.dispatches.lock().clear();
    }

    async fn complete(
        registry: &dyn ServiceRegistry,
        mut job: Job,
        host: &str,
    ) -> Result<(), RegistryError> {
        job.processing_host = Some(host.to_string());
        for status in [JobStatus::Dispatching, JobStatus::Running, JobStatus::Finished] {
            job.set_status(status);
            job = registry.update_job(job).await?;
        }
        Ok(())
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        job: Job,
        preferred_host: Option<&str>,
    ) -> Result<DispatchStatus, AdmissionError> {
        self.dispatches.lock().push(DispatchRecord {
            job_id: job.id,
            job_type: job.job_type.clone(),
            preferred_host: preferred_host.map(str::to_string),
        });

        let mut result = self.result.lock().clone();
        if let DispatchStatus::Accepted { host } = &mut result {
            if let Some(preferred) = preferred_host {
                *host = preferred.to_string();
            }
            if let Some(registry) = &self.registry {
                Self::complete(registry.as_ref(), job, host).await?;
            }
        }
        Ok(result)
    }
}
