use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{AdmissionError, RegistryError};
use crate::job::{Job, JobId, JobStatus};
use crate::registry::ServiceRegistry;

use super::controller::JobAdmission;

/// Result of offering a job to the cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    /// A producer on `host` admitted the job.
    Accepted { host: String },
    /// Every matching producer declined; the job is back in QUEUED.
    Declined,
    /// No producer for the job's type is known on the requested hosts.
    Undispatchable,
}

/// Routes queued jobs to producers.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Offer `job` to producers of its type, restricted to `preferred_host`
    /// when one is given.
    async fn dispatch(
        &self,
        job: Job,
        preferred_host: Option<&str>,
    ) -> Result<DispatchStatus, AdmissionError>;
}

/// In-process dispatcher over a set of registered producers.
///
/// Candidates are tried least loaded host first. Before a producer is asked,
/// the job is marked DISPATCHING on that producer's host so the load it
/// adds is visible to the admission decision.
pub struct ProducerDispatcher {
    registry: Arc<dyn ServiceRegistry>,
    producers: RwLock<Vec<Arc<dyn JobAdmission>>>,
}

impl fmt::Debug for ProducerDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let producers: Vec<(String, String)> = self
            .producers
            .try_read()
            .map(|producers| {
                producers
                    .iter()
                    .map(|p| (p.job_type().to_string(), p.host()))
                    .collect()
            })
            .unwrap_or_default();

        f.debug_struct("ProducerDispatcher")
            .field("producers", &producers)
            .finish()
    }
}

impl ProducerDispatcher {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            producers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, producer: Arc<dyn JobAdmission>) {
        tracing::debug!(
            job_type = %producer.job_type(),
            host = %producer.host(),
            "registered producer"
        );
        self.producers.write().push(producer);
    }

    pub fn producer_count(&self) -> usize {
        self.producers.read().len()
    }

    async fn candidates(
        &self,
        job_type: &str,
        preferred_host: Option<&str>,
    ) -> Result<Vec<Arc<dyn JobAdmission>>, RegistryError> {
        let mut candidates: Vec<(f32, String, Arc<dyn JobAdmission>)> = {
            let producers = self.producers.read();
            producers
                .iter()
                .filter(|p| p.job_type() == job_type)
                .filter(|p| preferred_host.is_none_or(|host| p.host() == host))
                .map(|p| (0.0, p.host(), Arc::clone(p)))
                .collect()
        };
        if candidates.len() > 1 {
            let loads = self.registry.get_current_host_loads(true).await?;
            for (load, host, _) in candidates.iter_mut() {
                *load = loads.get(host).map(|n| n.load_factor).unwrap_or(0.0);
            }
            candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        }
        Ok(candidates.into_iter().map(|(_, _, p)| p).collect())
    }

    /// Return a job whose admission failed to the queue, unless the
    /// producer already moved it past DISPATCHING.
    async fn release(&self, job_id: JobId) {
        let outcome = match self.registry.get_job(job_id).await {
            Ok(job) if job.status == JobStatus::Dispatching => {
                self.requeue(job).await.map(|_| ())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            tracing::warn!(%job_id, error = %err, "unable to requeue job after failed admission");
        }
    }

    async fn requeue(&self, mut job: Job) -> Result<Job, RegistryError> {
        job.set_status(JobStatus::Queued);
        job.processing_host = None;
        self.registry.update_job(job).await
    }
}

#[async_trait]
impl JobDispatcher for ProducerDispatcher {
    async fn dispatch(
        &self,
        mut job: Job,
        preferred_host: Option<&str>,
    ) -> Result<DispatchStatus, AdmissionError> {
        let candidates = self.candidates(&job.job_type, preferred_host).await?;
        if candidates.is_empty() {
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                preferred_host = ?preferred_host,
                "no producer available for job"
            );
            return Ok(DispatchStatus::Undispatchable);
        }

        for producer in candidates {
            let host = producer.host();
            job.set_status(JobStatus::Dispatching);
            job.processing_host = Some(host.clone());
            job = self.registry.update_job(job).await?;

            match producer.is_ready_to_accept(&job).await {
                Ok(true) => {
                    let job_id = job.id;
                    if let Err(err) = producer.admit(job).await {
                        self.release(job_id).await;
                        return Err(err);
                    }
                    return Ok(DispatchStatus::Accepted { host });
                }
                Ok(false) => {
                    tracing::debug!(job_id = %job.id, %host, "producer declined job");
                    job = self.requeue(job).await?;
                }
                Err(err) => {
                    if let Err(revert) = self.requeue(job).await {
                        tracing::warn!(
                            error = %revert,
                            "unable to requeue job after failed admission check"
                        );
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(DispatchStatus::Declined)
    }
}
