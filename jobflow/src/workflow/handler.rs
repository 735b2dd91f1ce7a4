use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::cancel::CancelToken;
use crate::error::OperationError;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::producer::JobDispatcher;
use crate::registry::ServiceRegistry;

use super::barrier::{BarrierResult, JobBarrier};
use super::instance::{MediaPackage, WorkflowId, WorkflowInstance};

/// Template of the operation inserted when a HOLD operation fails.
pub const ERROR_RESOLUTION_HANDLER_ID: &str = "error-resolution";

/// How the workflow proceeds after a handler returns.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Action {
    #[default]
    Continue,
    /// Suspend the workflow; the next resume calls the handler's resume path.
    Pause,
    Skip,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperationResult {
    pub action: Action,
    /// Replaces the workflow's media package when set.
    pub media_package: Option<MediaPackage>,
    /// Merged into the workflow configuration.
    pub properties: BTreeMap<String, String>,
}

impl OperationResult {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn pause() -> Self {
        Self {
            action: Action::Pause,
            ..Self::default()
        }
    }

    pub fn skip() -> Self {
        Self {
            action: Action::Skip,
            ..Self::default()
        }
    }

    pub fn with_media_package(mut self, media_package: MediaPackage) -> Self {
        self.media_package = Some(media_package);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Implementation of an operation template.
#[async_trait]
pub trait WorkflowOperationHandler: Send + Sync {
    async fn start(
        &self,
        workflow: &WorkflowInstance,
        ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError>;

    /// Called when a workflow paused by this operation is resumed.
    async fn resume(
        &self,
        _workflow: &WorkflowInstance,
        _ctx: &OperationContext,
        _properties: &BTreeMap<String, String>,
    ) -> Result<OperationResult, OperationError> {
        Ok(OperationResult::proceed())
    }
}

/// Holds a workflow until an operator resolves the failure and resumes it.
#[derive(Debug, Default)]
pub struct ErrorResolutionHandler;

#[async_trait]
impl WorkflowOperationHandler for ErrorResolutionHandler {
    async fn start(
        &self,
        _workflow: &WorkflowInstance,
        _ctx: &OperationContext,
    ) -> Result<OperationResult, OperationError> {
        Ok(OperationResult::pause())
    }
}

/// Template name to handler mapping.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn WorkflowOperationHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("templates", &self.templates())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `template`, replacing any previous one.
    pub fn register(
        &self,
        template: impl Into<String>,
        handler: Arc<dyn WorkflowOperationHandler>,
    ) {
        self.handlers.write().insert(template.into(), handler);
    }

    pub fn get(&self, template: &str) -> Option<Arc<dyn WorkflowOperationHandler>> {
        self.handlers.read().get(template).cloned()
    }

    pub fn contains(&self, template: &str) -> bool {
        self.handlers.read().contains_key(template)
    }

    pub fn templates(&self) -> Vec<String> {
        let mut templates: Vec<String> = self.handlers.read().keys().cloned().collect();
        templates.sort();
        templates
    }
}

/// Everything a handler needs while running one operation.
pub struct OperationContext {
    pub workflow_id: WorkflowId,
    pub operation_index: usize,
    /// Job backing this operation; jobs dispatched here become its children.
    pub job_id: JobId,
    pub execution_host: Option<String>,
    /// Host child jobs must run on after a failover.
    pub route_to: Option<String>,
    pub(crate) registry: Arc<dyn ServiceRegistry>,
    pub(crate) dispatcher: Option<Arc<dyn JobDispatcher>>,
    pub(crate) cancel: CancelToken,
    pub(crate) poll_interval: Duration,
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("workflow_id", &self.workflow_id)
            .field("operation_index", &self.operation_index)
            .field("job_id", &self.job_id)
            .field("execution_host", &self.execution_host)
            .field("route_to", &self.route_to)
            .finish()
    }
}

impl OperationContext {
    pub fn registry(&self) -> Arc<dyn ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Create a child job of this operation and queue it for dispatch.
    pub async fn dispatch(
        &self,
        job_type: impl Into<String> + Send,
        operation: impl Into<String> + Send,
        arguments: Vec<String>,
        job_load: f32,
    ) -> Result<Job, OperationError> {
        let mut job = self
            .registry
            .create_job(
                NewJob::new(job_type, operation, arguments, job_load)
                    .with_parent(Some(self.job_id)),
            )
            .await?;
        job.set_status(JobStatus::Queued);
        let job = self.registry.update_job(job).await?;

        if let Some(dispatcher) = &self.dispatcher {
            let id = job.id;
            if let Err(err) = dispatcher.dispatch(job.clone(), self.route_to.as_deref()).await {
                tracing::warn!(
                    job_id = %id,
                    error = %err,
                    "initial dispatch failed; will retry while waiting"
                );
            }
        }
        Ok(job)
    }

    /// Wait until every job in `jobs` is terminal, re-offering queued ones.
    pub async fn wait_for(&self, jobs: &[JobId]) -> Result<BarrierResult, OperationError> {
        JobBarrier::new(Arc::clone(&self.registry), self.poll_interval, self.cancel.clone())
            .with_dispatcher(self.dispatcher.clone(), self.route_to.clone())
            .wait_for(jobs)
            .await
    }

    /// Dispatch a child job and wait for it, failing unless it finishes.
    pub async fn dispatch_and_wait(
        &self,
        job_type: impl Into<String> + Send,
        operation: impl Into<String> + Send,
        arguments: Vec<String>,
        job_load: f32,
    ) -> Result<Job, OperationError> {
        let job = self.dispatch(job_type, operation, arguments, job_load).await?;
        let result = self.wait_for(&[job.id]).await?;
        if let Some((job_id, status)) = result.first_failure() {
            return Err(OperationError::JobFailed { job_id, status });
        }
        Ok(self.registry.get_job(job.id).await?)
    }
}
