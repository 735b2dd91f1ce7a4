use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobflow::*;
use parking_lot::Mutex;

/// Service registry keeping jobs and hosts in memory.
///
/// Updates are versioned: writing a job whose version differs from the
/// stored one fails with [`RegistryError::StaleJob`], and illegal status
/// transitions fail with [`RegistryError::IllegalTransition`]. A host's
/// current load is its simulated base load plus the load of its active jobs.
#[derive(Clone)]
pub struct InMemoryServiceRegistry {
    hostname: String,
    state: Arc<Mutex<RegistryState>>,
    unavailable: Arc<AtomicBool>,
    failing_updates: Arc<AtomicUsize>,
    create_delay: Arc<Mutex<Option<Duration>>>,
}

#[derive(Default)]
struct RegistryState {
    jobs: BTreeMap<JobId, Job>,
    max_loads: BTreeMap<String, f32>,
    base_loads: HashMap<String, f32>,
}

impl InMemoryServiceRegistry {
    /// Registry for `hostname`, registered with a max load of 4.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let registry = Self {
            hostname: hostname.clone(),
            state: Arc::new(Mutex::new(RegistryState::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
            failing_updates: Arc::new(AtomicUsize::new(0)),
            create_delay: Arc::new(Mutex::new(None)),
        };
        registry.register_host(hostname, 4.0);
        registry
    }

    pub fn with_host(self, host: impl Into<String>, max_load: f32) -> Self {
        self.register_host(host, max_load);
        self
    }

    pub fn register_host(&self, host: impl Into<String>, max_load: f32) {
        self.state.lock().max_loads.insert(host.into(), max_load);
    }

    /// Simulate load on `host` from work outside this registry.
    pub fn set_base_load(&self, host: impl Into<String>, load: f32) {
        self.state.lock().base_loads.insert(host.into(), load);
    }

    /// Make every call fail with [`RegistryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` job updates fail with
    /// [`RegistryError::Unavailable`].
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Hold every job creation for `delay` before it is stored.
    pub fn delay_creates(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    /// Store `job` as-is, bypassing transition checks.
    pub fn insert_job(&self, job: Job) -> Job {
        self.state.lock().jobs.insert(job.id, job.clone());
        job
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.values().cloned().collect()
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.state.lock().jobs.get(&id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry offline".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryServiceRegistry")
            .field("hostname", &self.hostname)
            .field("jobs", &state.jobs.len())
            .field("hosts", &state.max_loads)
            .finish()
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    async fn create_job(&self, request: NewJob) -> Result<Job, RegistryError> {
        self.check_available()?;
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (creator, organization, current_job) = match ExecutionContext::current() {
            Some(ctx) => (ctx.user.username, ctx.organization.id, ctx.current_job),
            None => ("system".to_string(), "default".to_string(), None),
        };
        let mut job = Job::new(
            request.job_type,
            request.operation,
            request.arguments,
            request.job_load,
        )
        .with_identity(creator, organization)
        .with_parent(request.parent_job_id.or(current_job));
        job.version = 1;

        self.state.lock().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn update_job(&self, mut job: Job) -> Result<Job, RegistryError> {
        self.check_available()?;
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RegistryError::Unavailable("update rejected".to_string()));
        }

        let mut state = self.state.lock();
        let stored = state
            .jobs
            .get(&job.id)
            .ok_or(RegistryError::JobNotFound(job.id))?;

        if stored.version != job.version {
            tracing::debug!(job_id = %job.id, "rejecting stale job update");
            return Err(RegistryError::StaleJob {
                job_id: job.id,
                expected: job.version,
                actual: stored.version,
            });
        }
        if !stored.status.can_transition_to(job.status) {
            return Err(RegistryError::IllegalTransition {
                job_id: job.id,
                from: stored.status,
                to: job.status,
            });
        }

        job.version += 1;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, RegistryError> {
        self.check_available()?;
        self.job(id).ok_or(RegistryError::JobNotFound(id))
    }

    async fn child_jobs(&self, parent: JobId) -> Result<Vec<Job>, RegistryError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.parent_job_id == Some(parent))
            .cloned()
            .collect())
    }

    async fn remove_jobs(&self, ids: &[JobId]) -> Result<(), RegistryError> {
        self.check_available()?;
        let mut state = self.state.lock();
        for id in ids {
            state.jobs.remove(id);
        }
        Ok(())
    }

    async fn count(&self, job_type: &str, status: JobStatus) -> Result<u64, RegistryError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.job_type == job_type && job.status == status)
            .count() as u64)
    }

    /// Jobs still DISPATCHING are only counted when `include_own_job_load`
    /// is set.
    async fn get_current_host_loads(
        &self,
        include_own_job_load: bool,
    ) -> Result<SystemLoad, RegistryError> {
        self.check_available()?;
        let state = self.state.lock();

        let mut loads = SystemLoad::new();
        for host in state.max_loads.keys() {
            let base = state.base_loads.get(host).copied().unwrap_or(0.0);
            let jobs: f32 = state
                .jobs
                .values()
                .filter(|job| job.processing_host.as_deref() == Some(host.as_str()))
                .filter(|job| job.status.is_active())
                .filter(|job| include_own_job_load || job.status != JobStatus::Dispatching)
                .map(|job| job.job_load)
                .sum();
            loads.add_node_load(NodeLoad::new(host.clone(), base + jobs));
        }
        Ok(loads)
    }

    async fn get_max_load_on_node(&self, host: &str) -> Result<NodeLoad, RegistryError> {
        self.check_available()?;
        self.state
            .lock()
            .max_loads
            .get(host)
            .map(|max| NodeLoad::new(host, *max))
            .ok_or_else(|| RegistryError::HostNotFound(host.to_string()))
    }

    async fn get_max_loads(&self) -> Result<SystemLoad, RegistryError> {
        self.check_available()?;
        let mut loads = SystemLoad::new();
        for (host, max) in self.state.lock().max_loads.iter() {
            loads.add_node_load(NodeLoad::new(host.clone(), *max));
        }
        Ok(loads)
    }
}

/// One reported incident.
#[derive(Clone, Debug, PartialEq)]
pub struct Incident {
    pub job_id: JobId,
    pub job_type: String,
    pub job_status: JobStatus,
    pub severity: Severity,
    pub message: String,
    pub reported_at: DateTime<Utc>,
}

/// Incident sink that keeps every report for later assertions.
#[derive(Clone, Debug, Default)]
pub struct RecordingIncidentSink {
    incidents: Arc<Mutex<Vec<Incident>>>,
}

impl RecordingIncidentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.incidents.lock().len()
    }

    pub fn count_severity(&self, severity: Severity) -> usize {
        self.incidents
            .lock()
            .iter()
            .filter(|i| i.severity == severity)
            .count()
    }
}

#[async_trait]
impl IncidentSink for RecordingIncidentSink {
    async fn unhandled_exception(
        &self,
        job: &Job,
        severity: Severity,
        error: &(dyn std::error::Error + Send + Sync + 'static),
    ) {
        self.incidents.lock().push(Incident {
            job_id: job.id,
            job_type: job.job_type.clone(),
            job_status: job.status,
            severity,
            message: error.to_string(),
            reported_at: Utc::now(),
        });
    }
}
