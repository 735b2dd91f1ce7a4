//! Operation handlers with scripted behavior.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jobflow::*;
use parking_lot::Mutex;

/// Succeeds every time.
#[derive(Clone, Debug, Default)]
pub struct SucceedingHandler {
    starts: Arc<AtomicUsize>,
}

impl SucceedingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowOperationHandler for SucceedingHandler {
    async fn start(
        &self,
        _workflow: &WorkflowInstance,
        _ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(OperationResult::proceed())
    }
}

/// Fails its first `failures` starts, then succeeds.
#[derive(Clone, Debug)]
pub struct FlakyHandler {
    failures: usize,
    starts: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures,
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails on every start.
    pub fn always() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowOperationHandler for FlakyHandler {
    async fn start(
        &self,
        _workflow: &WorkflowInstance,
        _ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError> {
        let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(OperationError::msg(format!("scripted failure {}", attempt + 1)));
        }
        Ok(OperationResult::proceed())
    }
}

/// Pauses on start and continues on resume.
#[derive(Clone, Debug, Default)]
pub struct PausingHandler {
    starts: Arc<AtomicUsize>,
    resumes: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
}

impl PausingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.lock().len()
    }

    /// Properties passed to each resume.
    pub fn resume_properties(&self) -> Vec<BTreeMap<String, String>> {
        self.resumes.lock().clone()
    }
}

#[async_trait]
impl WorkflowOperationHandler for PausingHandler {
    async fn start(
        &self,
        _workflow: &WorkflowInstance,
        _ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(OperationResult::pause())
    }

    async fn resume(
        &self,
        _workflow: &WorkflowInstance,
        _ctx: &OperationContext,
        properties: &BTreeMap<String, String>,
    ) -> Result<OperationResult, OperationError> {
        self.resumes.lock().push(properties.clone());
        Ok(OperationResult::proceed())
    }
}

/// Where an operation was asked to run.
#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub execution_host: Option<String>,
    pub route_to: Option<String>,
}

/// Fails whenever it runs with `host` as execution host.
#[derive(Clone, Debug)]
pub struct HostFailingHandler {
    host: String,
    placements: Arc<Mutex<Vec<Placement>>>,
}

impl HostFailingHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            placements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn placements(&self) -> Vec<Placement> {
        self.placements.lock().clone()
    }
}

#[async_trait]
impl WorkflowOperationHandler for HostFailingHandler {
    async fn start(
        &self,
        _workflow: &WorkflowInstance,
        ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError> {
        self.placements.lock().push(Placement {
            execution_host: ctx.execution_host.clone(),
            route_to: ctx.route_to.clone(),
        });
        // A fresh operation has no execution host yet and runs locally.
        if ctx.execution_host.as_deref().is_none_or(|h| h == self.host) {
            return Err(OperationError::msg(format!("host {} is broken", self.host)));
        }
        Ok(OperationResult::proceed())
    }
}

/// Dispatches one child job per start and waits for it.
#[derive(Clone, Debug)]
pub struct DispatchingHandler {
    job_type: String,
    job_load: f32,
    children: Arc<Mutex<Vec<JobId>>>,
}

impl DispatchingHandler {
    pub fn new(job_type: impl Into<String>, job_load: f32) -> Self {
        Self {
            job_type: job_type.into(),
            job_load,
            children: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn children(&self) -> Vec<JobId> {
        self.children.lock().clone()
    }

    /// Poll until at least `count` children were dispatched.
    pub async fn wait_dispatched(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.children.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.children.lock().len() >= count
    }
}

#[async_trait]
impl WorkflowOperationHandler for DispatchingHandler {
    async fn start(
        &self,
        workflow: &WorkflowInstance,
        ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError> {
        let job = ctx
            .dispatch(
                self.job_type.clone(),
                "PROCESS",
                vec![workflow.id.to_string()],
                self.job_load,
            )
            .await?;
        self.children.lock().push(job.id);

        let result = ctx.wait_for(&[job.id]).await?;
        if let Some((job_id, status)) = result.first_failure() {
            return Err(OperationError::JobFailed { job_id, status });
        }
        Ok(OperationResult::proceed().with_property("child.job", job.id.to_string()))
    }
}
