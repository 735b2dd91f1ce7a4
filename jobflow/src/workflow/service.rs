use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::cancel::CancelToken;
use crate::config::WorkflowConfig;
use crate::context::ExecutionContext;
use crate::error::{OperationError, RegistryError, WorkflowError};
use crate::events::{EventSubscriber, WorkflowEvent, WorkflowEventBus, WorkflowEventPayload};
use crate::identity::IdentityDirectory;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::load::select_alternate_host;
use crate::producer::JobDispatcher;
use crate::registry::{IncidentSink, ServiceRegistry, Severity, cancel_job};
use crate::telemetry;

use super::definition::{RetryStrategy, WorkflowDefinition};
use super::handler::{
    Action, ERROR_RESOLUTION_HANDLER_ID, HandlerRegistry, OperationContext, OperationResult,
};
use super::instance::{
    MediaPackage, OperationState, WorkflowId, WorkflowInstance, WorkflowOperationInstance,
    WorkflowState,
};
use super::listener::{ListenerId, ListenerSet, WorkflowListener};
use super::query::{WorkflowQuery, WorkflowSet, WorkflowStatistics};

/// Job type of the registry jobs backing workflow operations.
pub const WORKFLOW_JOB_TYPE: &str = "jobflow.workflow";
/// Backing job operation for a first or repeated start.
pub const START_OPERATION: &str = "START_OPERATION";
/// Backing job operation for a resume after a pause.
pub const RESUME_OPERATION: &str = "RESUME";

/// Configuration key set on a HOLD resolution step naming the failed template.
pub const FAILED_OPERATION_KEY: &str = "failed-operation";

/// Runs workflow instances.
///
/// Each started instance advances on its own task, one operation at a time.
/// Control calls (`pause`, `resume`, `stop`, `update`) only touch the stored
/// instance; the advancing task picks up their effect at the next operation
/// boundary, or sooner when an operation is waiting on jobs.
#[derive(Clone)]
pub struct WorkflowService {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkflowConfig,
    registry: Arc<dyn ServiceRegistry>,
    identity: Arc<dyn IdentityDirectory>,
    incidents: Arc<dyn IncidentSink>,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
    handlers: HandlerRegistry,
    definitions: RwLock<BTreeMap<String, WorkflowDefinition>>,
    workflows: Mutex<BTreeMap<WorkflowId, StoredWorkflow>>,
    listeners: ListenerSet,
    events: WorkflowEventBus,
}

struct StoredWorkflow {
    instance: WorkflowInstance,
    /// Fired by pause and stop to interrupt a waiting operation.
    interrupt: CancelToken,
    pause_requested: bool,
    resume_properties: BTreeMap<String, String>,
}

impl StoredWorkflow {
    fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            interrupt: CancelToken::new(),
            pause_requested: false,
            resume_properties: BTreeMap::new(),
        }
    }

    fn set_state(&mut self, to: WorkflowState, notices: &mut Vec<Notice>) {
        let from = self.instance.state;
        if from == to {
            return;
        }
        self.instance.set_state(to);
        notices.push(Notice::State {
            workflow: self.instance.clone(),
            from,
        });
    }

    fn operation_changed(&self, index: usize, notices: &mut Vec<Notice>) {
        notices.push(Notice::Operation {
            workflow: self.instance.clone(),
            index,
        });
    }

    /// Apply a pending pause, resetting the interrupt for the next run.
    fn enter_pause(&mut self, notices: &mut Vec<Notice>) {
        self.pause_requested = false;
        self.interrupt = CancelToken::new();
        self.set_state(WorkflowState::Paused, notices);
    }
}

/// Transition observed under the store lock, delivered after it is released.
enum Notice {
    State {
        workflow: WorkflowInstance,
        from: WorkflowState,
    },
    Operation {
        workflow: WorkflowInstance,
        index: usize,
    },
}

/// An operation about to run, captured from the stored instance.
struct Step {
    workflow_id: WorkflowId,
    instance: WorkflowInstance,
    index: usize,
    resuming: bool,
    properties: BTreeMap<String, String>,
    interrupt: CancelToken,
    route_to: Option<String>,
}

impl Step {
    fn operation(&self) -> &WorkflowOperationInstance {
        &self.instance.operations[self.index]
    }
}

/// Backing job change decided while settling an operation.
struct JobTransition {
    job_id: JobId,
    status: JobStatus,
}

impl fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workflows = self
            .inner
            .workflows
            .try_lock()
            .map(|w| w.len())
            .unwrap_or_default();

        f.debug_struct("WorkflowService")
            .field("config", &self.inner.config)
            .field("handlers", &self.inner.handlers)
            .field("definitions", &self.inner.definitions.read().len())
            .field("workflows", &workflows)
            .field("has_dispatcher", &self.inner.dispatcher.is_some())
            .field("events", &self.inner.events)
            .finish()
    }
}

impl WorkflowService {
    pub(crate) fn new(
        config: WorkflowConfig,
        registry: Arc<dyn ServiceRegistry>,
        identity: Arc<dyn IdentityDirectory>,
        incidents: Arc<dyn IncidentSink>,
        dispatcher: Option<Arc<dyn JobDispatcher>>,
        handlers: HandlerRegistry,
    ) -> Self {
        let events = WorkflowEventBus::new(config.event_channel_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                identity,
                incidents,
                dispatcher,
                handlers,
                definitions: RwLock::new(BTreeMap::new()),
                workflows: Mutex::new(BTreeMap::new()),
                listeners: ListenerSet::default(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    /// Register a definition so it can be started by id and used as an
    /// error handler.
    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        self.inner.validate(&definition)?;
        tracing::debug!(definition = %definition.id, "registered workflow definition");
        self.inner
            .definitions
            .write()
            .insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn unregister_definition(&self, id: &str) -> bool {
        self.inner.definitions.write().remove(id).is_some()
    }

    pub fn definition(&self, id: &str) -> Option<WorkflowDefinition> {
        self.inner.definitions.read().get(id).cloned()
    }

    pub fn definitions(&self) -> Vec<WorkflowDefinition> {
        self.inner.definitions.read().values().cloned().collect()
    }

    /// Start `definition` against `media_package`.
    ///
    /// The instance runs under the identity installed on the calling task,
    /// or the configured system identity. Every template must have a
    /// registered handler.
    pub fn start(
        &self,
        definition: &WorkflowDefinition,
        media_package: MediaPackage,
        parent: Option<WorkflowId>,
        configuration: BTreeMap<String, String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        self.inner.validate(definition)?;
        if let Some(parent) = parent {
            if !self.inner.workflows.lock().contains_key(&parent) {
                return Err(WorkflowError::NotFound(parent));
            }
        }

        let (creator, organization) = match ExecutionContext::current() {
            Some(ctx) => (ctx.user.username, ctx.organization.id),
            None => (
                self.inner.config.system_user.clone(),
                self.inner.config.system_organization.clone(),
            ),
        };

        let instance = WorkflowInstance {
            id: WorkflowId::new(),
            title: definition.title.clone(),
            template: definition.id.clone(),
            state: WorkflowState::Instantiated,
            parent_id: parent,
            creator,
            organization,
            media_package,
            configuration,
            operations: definition
                .operations
                .iter()
                .map(WorkflowOperationInstance::from_definition)
                .collect(),
            cursor: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        let id = instance.id;
        let snapshot = instance.clone();

        self.inner
            .workflows
            .lock()
            .insert(id, StoredWorkflow::new(instance));
        tracing::info!(workflow_id = %id, definition = %definition.id, "workflow started");

        Arc::clone(&self.inner).spawn_run(id, &definition.id);
        Ok(snapshot)
    }

    /// Start a registered definition by id.
    pub fn start_by_id(
        &self,
        definition_id: &str,
        media_package: MediaPackage,
        configuration: BTreeMap<String, String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let definition = self
            .definition(definition_id)
            .ok_or_else(|| WorkflowError::DefinitionNotFound(definition_id.to_string()))?;
        self.start(&definition, media_package, None, configuration)
    }

    /// Ask a running workflow to pause.
    ///
    /// The pause lands at the next operation boundary; an operation waiting
    /// on jobs is interrupted and started again on resume. Calls against a
    /// workflow that is not running are ignored.
    pub fn pause(&self, id: WorkflowId) -> Result<WorkflowInstance, WorkflowError> {
        let mut workflows = self.inner.workflows.lock();
        let stored = workflows.get_mut(&id).ok_or(WorkflowError::NotFound(id))?;

        if matches!(
            stored.instance.state,
            WorkflowState::Instantiated | WorkflowState::Running
        ) {
            tracing::debug!(workflow_id = %id, "pause requested");
            stored.pause_requested = true;
            stored.interrupt.cancel();
        }
        Ok(stored.instance.clone())
    }

    /// Resume a paused workflow. `properties` are handed to the paused
    /// operation's resume path. Calls against a workflow that is not paused
    /// are ignored.
    pub fn resume(
        &self,
        id: WorkflowId,
        properties: BTreeMap<String, String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let mut notices = Vec::new();
        let (snapshot, resumed) = {
            let mut workflows = self.inner.workflows.lock();
            let stored = workflows.get_mut(&id).ok_or(WorkflowError::NotFound(id))?;

            if stored.instance.state == WorkflowState::Paused {
                stored.resume_properties = properties;
                stored.pause_requested = false;
                stored.set_state(WorkflowState::Running, &mut notices);
                (stored.instance.clone(), true)
            } else {
                (stored.instance.clone(), false)
            }
        };

        self.inner.publish(notices);
        if resumed {
            Arc::clone(&self.inner).spawn_run(id, &snapshot.template);
        }
        Ok(snapshot)
    }

    /// Stop a workflow and cancel every job still running for it.
    ///
    /// Stopping a workflow that already ended is a no-op.
    pub async fn stop(&self, id: WorkflowId) -> Result<WorkflowInstance, WorkflowError> {
        let mut notices = Vec::new();
        let (snapshot, job_ids) = {
            let mut workflows = self.inner.workflows.lock();
            let stored = workflows.get_mut(&id).ok_or(WorkflowError::NotFound(id))?;

            if stored.instance.state.is_terminal() {
                return Ok(stored.instance.clone());
            }
            stored.set_state(WorkflowState::Stopped, &mut notices);
            stored.interrupt.cancel();
            (stored.instance.clone(), stored.instance.job_ids())
        };

        self.inner.publish(notices);
        self.inner.cancel_jobs(&job_ids).await;
        Ok(snapshot)
    }

    /// Delete a workflow together with its operations' jobs and their
    /// children. A workflow that has not ended is stopped first.
    pub async fn remove(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        self.stop(id).await?;

        let job_ids = {
            let workflows = self.inner.workflows.lock();
            let stored = workflows.get(&id).ok_or(WorkflowError::NotFound(id))?;
            stored.instance.job_ids()
        };
        self.inner.remove_jobs(&job_ids).await?;

        self.inner.workflows.lock().remove(&id);
        self.inner
            .events
            .emit(WorkflowEvent::new(id, WorkflowEventPayload::Removed));
        tracing::info!(workflow_id = %id, "workflow removed");
        Ok(())
    }

    /// Remove ended workflows that completed more than `older_than` ago,
    /// optionally only those in `state`. Returns how many were removed.
    pub async fn cleanup_workflow_instances(
        &self,
        older_than: chrono::Duration,
        state: Option<WorkflowState>,
    ) -> Result<usize, WorkflowError> {
        let cutoff = Utc::now() - older_than;
        let candidates: Vec<WorkflowId> = self
            .inner
            .workflows
            .lock()
            .values()
            .map(|stored| &stored.instance)
            .filter(|wf| wf.state.is_terminal())
            .filter(|wf| state.is_none_or(|s| s == wf.state))
            .filter(|wf| wf.completed_at.is_some_and(|at| at <= cutoff))
            .map(|wf| wf.id)
            .collect();

        for id in &candidates {
            self.remove(*id).await?;
        }
        if !candidates.is_empty() {
            tracing::info!(removed = candidates.len(), "cleaned up workflow instances");
        }
        Ok(candidates.len())
    }

    /// Replace the title, media package and configuration of a workflow.
    ///
    /// Returns `false` without changing anything when the workflow is paused
    /// or has ended; another controller may already have retired it.
    pub fn update(&self, workflow: &WorkflowInstance) -> Result<bool, WorkflowError> {
        let mut workflows = self.inner.workflows.lock();
        let stored = workflows
            .get_mut(&workflow.id)
            .ok_or(WorkflowError::NotFound(workflow.id))?;

        let state = stored.instance.state;
        if state == WorkflowState::Paused || state.is_terminal() {
            tracing::debug!(workflow_id = %workflow.id, %state, "ignoring update");
            return Ok(false);
        }

        stored.instance.title = workflow.title.clone();
        stored.instance.media_package = workflow.media_package.clone();
        stored.instance.configuration = workflow.configuration.clone();
        Ok(true)
    }

    pub fn get_workflow_by_id(&self, id: WorkflowId) -> Result<WorkflowInstance, WorkflowError> {
        self.inner
            .workflows
            .lock()
            .get(&id)
            .map(|stored| stored.instance.clone())
            .ok_or(WorkflowError::NotFound(id))
    }

    pub fn get_workflow_instances(&self, query: &WorkflowQuery) -> WorkflowSet {
        let matches: Vec<WorkflowInstance> = self
            .inner
            .workflows
            .lock()
            .values()
            .filter(|stored| query.matches(&stored.instance))
            .map(|stored| stored.instance.clone())
            .collect();
        WorkflowSet::page(matches, query)
    }

    /// Count workflows, optionally in `state` and currently at `operation`.
    pub fn count_workflow_instances(
        &self,
        state: Option<WorkflowState>,
        operation: Option<&str>,
    ) -> usize {
        self.inner
            .workflows
            .lock()
            .values()
            .map(|stored| &stored.instance)
            .filter(|wf| state.is_none_or(|s| s == wf.state))
            .filter(|wf| {
                operation.is_none_or(|template| {
                    wf.current_operation().is_some_and(|op| op.template == template)
                })
            })
            .count()
    }

    pub fn statistics(&self) -> WorkflowStatistics {
        let mut stats = WorkflowStatistics::default();
        for stored in self.inner.workflows.lock().values() {
            stats.record(stored.instance.state);
        }
        stats
    }

    pub fn add_listener(&self, listener: Arc<dyn WorkflowListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Subscribe to the workflow event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn validate(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        for template in definition.templates() {
            if !self.handlers.contains(template) {
                return Err(WorkflowError::HandlerNotFound(template.to_string()));
            }
        }
        Ok(())
    }

    fn spawn_run(self: Arc<Self>, id: WorkflowId, template: &str) {
        let span = telemetry::workflow_span(id, template);
        tokio::spawn(self.run(id).instrument(span));
    }

    fn publish(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::State { workflow, from } => {
                    telemetry::record_workflow_state(workflow.id, workflow.state.as_str());
                    self.listeners.state_changed(&workflow);
                    self.events.emit(WorkflowEvent::new(
                        workflow.id,
                        WorkflowEventPayload::StateChanged {
                            from,
                            to: workflow.state,
                        },
                    ));
                }
                Notice::Operation { workflow, index } => {
                    let Some(operation) = workflow.operations.get(index) else {
                        continue;
                    };
                    self.listeners.operation_changed(&workflow, operation);
                    self.events.emit(WorkflowEvent::new(
                        workflow.id,
                        WorkflowEventPayload::OperationChanged {
                            index,
                            template: operation.template.clone(),
                            state: operation.state,
                            job_id: operation.job_id,
                        },
                    ));
                }
            }
        }
    }

    async fn run(self: Arc<Self>, id: WorkflowId) {
        let Some(context) = self.execution_context(id).await else {
            return;
        };

        while let Some(step) = self.next_step(id) {
            let span = telemetry::operation_span(id, &step.operation().template, step.index);
            let outcome = context
                .clone()
                .scope(self.execute(&step))
                .instrument(span.clone())
                .await;
            let keep_going = self.settle(&step, outcome).instrument(span).await;
            if !keep_going {
                break;
            }
        }
    }

    /// Resolve the identity the workflow runs under. A workflow whose
    /// identity cannot be resolved fails.
    async fn execution_context(&self, id: WorkflowId) -> Option<ExecutionContext> {
        let (creator, organization) = {
            let workflows = self.workflows.lock();
            let stored = workflows.get(&id)?;
            (stored.instance.creator.clone(), stored.instance.organization.clone())
        };

        let resolved = async {
            let organization = self.identity.get_organization(&organization).await?;
            let user = self.identity.load_user(&creator, &organization.id).await?;
            Ok::<_, crate::error::IdentityError>(ExecutionContext::new(organization, user))
        }
        .await;

        match resolved {
            Ok(context) => Some(context),
            Err(err) => {
                tracing::error!(
                    workflow_id = %id,
                    error = %err,
                    "unable to resolve workflow identity"
                );
                let mut notices = Vec::new();
                if let Some(stored) = self.workflows.lock().get_mut(&id) {
                    if !stored.instance.state.is_terminal() {
                        stored.set_state(WorkflowState::Failed, &mut notices);
                    }
                }
                self.publish(notices);
                None
            }
        }
    }

    /// Pick the operation to run next, or finish the workflow.
    fn next_step(&self, id: WorkflowId) -> Option<Step> {
        let mut notices = Vec::new();
        let step = {
            let mut workflows = self.workflows.lock();
            let stored = workflows.get_mut(&id)?;
            self.advance(id, stored, &mut notices)
        };
        self.publish(notices);
        step
    }

    fn advance(
        &self,
        id: WorkflowId,
        stored: &mut StoredWorkflow,
        notices: &mut Vec<Notice>,
    ) -> Option<Step> {
        if !stored.instance.state.accepts_advancement() {
            return None;
        }
        if stored.pause_requested {
            stored.enter_pause(notices);
            return None;
        }
        if stored.instance.state == WorkflowState::Instantiated {
            stored.set_state(WorkflowState::Running, notices);
        }

        if stored.instance.state == WorkflowState::Failing {
            while let Some(op) = stored.instance.current_operation_mut() {
                if op.error_path {
                    break;
                }
                op.state = OperationState::Skipped;
                let index = stored.instance.cursor;
                stored.operation_changed(index, notices);
                stored.instance.cursor += 1;
            }
        }

        if stored.instance.cursor >= stored.instance.operations.len() {
            let end = if stored.instance.state == WorkflowState::Failing {
                WorkflowState::Failed
            } else {
                WorkflowState::Succeeded
            };
            stored.set_state(end, notices);
            return None;
        }

        let index = stored.instance.cursor;
        let hostname = self.registry.hostname();
        let op = &mut stored.instance.operations[index];
        let resuming = op.state == OperationState::Paused;
        if op.execution_host.is_none() {
            op.execution_host = Some(hostname);
        }
        let route_to = (op.retry_strategy == RetryStrategy::Failover && op.failed_attempts > 0)
            .then(|| op.execution_host.clone())
            .flatten();
        op.state = OperationState::Running;
        if op.started_at.is_none() {
            op.started_at = Some(Utc::now());
        }
        stored.operation_changed(index, notices);

        Some(Step {
            workflow_id: id,
            instance: stored.instance.clone(),
            index,
            resuming,
            properties: std::mem::take(&mut stored.resume_properties),
            interrupt: stored.interrupt.clone(),
            route_to,
        })
    }

    /// Run the step's handler. Must be called inside the workflow's
    /// execution context.
    async fn execute(&self, step: &Step) -> Result<OperationResult, OperationError> {
        let op = step.operation();
        let handler = self.handlers.get(&op.template).ok_or_else(|| {
            OperationError::msg(format!(
                "no handler registered for operation template {}",
                op.template
            ))
        })?;

        let job = self.prepare_backing_job(step).await?;
        if !self.attach_job(step.workflow_id, step.index, job.id) {
            self.cancel_jobs(&[job.id]).await;
            return Err(OperationError::Canceled);
        }

        let ctx = OperationContext {
            workflow_id: step.workflow_id,
            operation_index: step.index,
            job_id: job.id,
            execution_host: op.execution_host.clone(),
            route_to: step.route_to.clone(),
            registry: Arc::clone(&self.registry),
            dispatcher: self.dispatcher.clone(),
            cancel: step.interrupt.clone(),
            poll_interval: self.config.poll_interval(),
        };

        let scoped = ExecutionContext::current()
            .map(|c| c.with_current_job(Some(job.id)));
        let call = async {
            if step.resuming {
                handler.resume(&step.instance, &ctx, &step.properties).await
            } else {
                handler.start(&step.instance, &ctx).await
            }
        };
        match scoped {
            Some(scoped) => scoped.scope(call).await,
            None => call.await,
        }
    }

    /// Create or reuse the registry job that tracks this operation and mark
    /// it RUNNING.
    async fn prepare_backing_job(&self, step: &Step) -> Result<Job, RegistryError> {
        let op = step.operation();
        let operation = if step.resuming {
            RESUME_OPERATION
        } else {
            START_OPERATION
        };

        if let Some(job_id) = op.job_id {
            let mut job = self.registry.get_job(job_id).await?;
            if !job.status.is_terminal() {
                job.operation = operation.to_string();
                job.processing_host = op.execution_host.clone();
                if job.status != JobStatus::Running {
                    job.set_status(JobStatus::Running);
                }
                return self.registry.update_job(job).await;
            }
        }

        let mut job = self
            .registry
            .create_job(
                NewJob::new(
                    WORKFLOW_JOB_TYPE,
                    operation,
                    vec![step.workflow_id.to_string(), step.index.to_string()],
                    0.0,
                )
                .with_parent(None),
            )
            .await?;
        job.processing_host = op.execution_host.clone();
        job.set_status(JobStatus::Dispatching);
        let mut job = self.registry.update_job(job).await?;
        job.set_status(JobStatus::Running);
        self.registry.update_job(job).await
    }

    /// Record the operation's backing job. Returns `false` when the workflow
    /// ended or was removed while the job was being prepared.
    fn attach_job(&self, id: WorkflowId, index: usize, job_id: JobId) -> bool {
        let mut workflows = self.workflows.lock();
        let Some(stored) = workflows.get_mut(&id) else {
            return false;
        };
        if let Some(op) = stored.instance.operations.get_mut(index) {
            op.job_id = Some(job_id);
        }
        !stored.instance.state.is_terminal()
    }

    /// Record the outcome of a step. Returns whether the run loop continues.
    async fn settle(&self, step: &Step, outcome: Result<OperationResult, OperationError>) -> bool {
        let interrupted =
            matches!(outcome, Err(OperationError::Canceled)) && step.interrupt.is_cancelled();

        let failover_host = match &outcome {
            Err(_) if !interrupted => self.failover_target(step.operation()).await,
            _ => None,
        };

        let mut notices = Vec::new();
        let mut transition = None;
        let mut incident = None;
        let mut abandoned = None;

        let keep_going = {
            let mut workflows = self.workflows.lock();
            let Some(stored) = workflows.get_mut(&step.workflow_id) else {
                return false;
            };

            if stored.instance.state.is_terminal() {
                tracing::debug!(
                    workflow_id = %step.workflow_id,
                    state = %stored.instance.state,
                    "dropping outcome of operation on ended workflow"
                );
                if stored.instance.state == WorkflowState::Stopped {
                    abandoned = stored
                        .instance
                        .operations
                        .get(step.index)
                        .and_then(|op| op.job_id);
                }
                false
            } else if interrupted {
                if stored.pause_requested {
                    if let Some(op) = stored.instance.operations.get_mut(step.index) {
                        op.state = OperationState::Instantiated;
                    }
                    stored.operation_changed(step.index, &mut notices);
                    stored.enter_pause(&mut notices);
                }
                false
            } else {
                match outcome {
                    Ok(result) => {
                        self.settle_success(stored, step, result, &mut notices, &mut transition)
                    }
                    Err(err) => {
                        let keep_going = self.settle_failure(
                            stored,
                            step,
                            &err,
                            failover_host,
                            &mut notices,
                            &mut transition,
                        );
                        incident = Some(err);
                        keep_going
                    }
                }
            }
        };

        if let Some(job_id) = abandoned {
            self.cancel_jobs(&[job_id]).await;
        }
        if let Some(transition) = &transition {
            self.update_backing_job(transition).await;
        }
        if let Some(err) = incident {
            self.report_incident(step, transition.as_ref(), &err).await;
        }
        self.publish(notices);
        keep_going
    }

    fn settle_success(
        &self,
        stored: &mut StoredWorkflow,
        step: &Step,
        result: OperationResult,
        notices: &mut Vec<Notice>,
        transition: &mut Option<JobTransition>,
    ) -> bool {
        let instance = &mut stored.instance;
        let Some(op) = instance.operations.get_mut(step.index) else {
            return false;
        };
        let job_id = op.job_id;

        match result.action {
            Action::Continue | Action::Skip => {
                op.state = if result.action == Action::Skip {
                    OperationState::Skipped
                } else {
                    OperationState::Succeeded
                };
                op.completed_at = Some(Utc::now());
                if result.action == Action::Continue {
                    if let Some(media_package) = result.media_package {
                        instance.media_package = media_package;
                    }
                }
                instance.configuration.extend(result.properties);
                instance.cursor = step.index + 1;
                *transition = job_id.map(|job_id| JobTransition {
                    job_id,
                    status: JobStatus::Finished,
                });
                stored.operation_changed(step.index, notices);
                true
            }
            Action::Pause => {
                op.state = OperationState::Paused;
                instance.configuration.extend(result.properties);
                stored.operation_changed(step.index, notices);
                stored.enter_pause(notices);
                false
            }
        }
    }

    fn settle_failure(
        &self,
        stored: &mut StoredWorkflow,
        step: &Step,
        err: &OperationError,
        failover_host: Option<String>,
        notices: &mut Vec<Notice>,
        transition: &mut Option<JobTransition>,
    ) -> bool {
        let workflow_id = step.workflow_id;
        let index = step.index;
        let Some(op) = stored.instance.operations.get_mut(index) else {
            return false;
        };
        tracing::warn!(
            %workflow_id,
            template = %op.template,
            error = %err,
            "operation failed"
        );

        op.record_failure();
        let job_id = op.job_id;
        let strategy = op.retry_strategy;
        let job_transition = |status| job_id.map(|job_id| JobTransition { job_id, status });

        match strategy {
            RetryStrategy::Retry if op.has_attempts_left() => {
                op.state = OperationState::Retry;
                telemetry::record_operation_retry(
                    workflow_id,
                    &op.template,
                    strategy.as_str(),
                    op.failed_attempts,
                );
                *transition = job_transition(JobStatus::Retry);
                stored.operation_changed(index, notices);
                return true;
            }
            RetryStrategy::Failover if op.has_attempts_left() && failover_host.is_some() => {
                op.state = OperationState::Retry;
                op.execution_host = failover_host;
                telemetry::record_operation_retry(
                    workflow_id,
                    &op.template,
                    strategy.as_str(),
                    op.failed_attempts,
                );
                *transition = job_transition(JobStatus::Retry);
                stored.operation_changed(index, notices);
                return true;
            }
            RetryStrategy::Hold => {
                op.state = OperationState::Retry;
                let failed_template = op.template.clone();
                telemetry::record_operation_retry(
                    workflow_id,
                    &failed_template,
                    strategy.as_str(),
                    op.failed_attempts,
                );

                let mut resolution = WorkflowOperationInstance::new(ERROR_RESOLUTION_HANDLER_ID);
                resolution.state = OperationState::Paused;
                resolution.error_path = op.error_path;
                resolution
                    .configuration
                    .insert(FAILED_OPERATION_KEY.to_string(), failed_template);
                stored.instance.operations.insert(index, resolution);
                stored.instance.cursor = index;

                *transition = job_transition(JobStatus::Retry);
                stored.operation_changed(index, notices);
                stored.enter_pause(notices);
                return false;
            }
            RetryStrategy::Failover if op.has_attempts_left() => {
                tracing::warn!(
                    %workflow_id,
                    template = %op.template,
                    "no alternate host for failover; failing operation"
                );
            }
            _ => {}
        }

        op.state = OperationState::Failed;
        op.completed_at = Some(Utc::now());
        *transition = job_transition(JobStatus::Failed);
        let fail_on_error = op.fail_on_error;
        let error_path = op.error_path;
        let handler_definition = op.exception_handler_workflow.clone();
        stored.operation_changed(index, notices);

        if !fail_on_error {
            stored.instance.cursor = index + 1;
            return true;
        }

        stored.set_state(WorkflowState::Failing, notices);

        if error_path {
            // A failing error handler ends the workflow.
            let len = stored.instance.operations.len();
            for i in index + 1..len {
                let op = &mut stored.instance.operations[i];
                if !op.state.is_terminal() {
                    op.state = OperationState::Skipped;
                    stored.operation_changed(i, notices);
                }
            }
            stored.instance.cursor = stored.instance.operations.len();
            return true;
        }

        if let Some(handler_id) = handler_definition {
            match self.definitions.read().get(&handler_id) {
                Some(definition) => {
                    let spliced = definition.operations.iter().map(|def| {
                        let mut op = WorkflowOperationInstance::from_definition(def);
                        op.error_path = true;
                        op
                    });
                    let at = index + 1;
                    stored.instance.operations.splice(at..at, spliced);
                }
                None => tracing::warn!(
                    %workflow_id,
                    definition = %handler_id,
                    "error handler definition not registered"
                ),
            }
        }
        stored.instance.cursor = index + 1;
        true
    }

    /// Alternate host for a FAILOVER retry of `op`, if one should happen.
    async fn failover_target(&self, op: &WorkflowOperationInstance) -> Option<String> {
        if op.retry_strategy != RetryStrategy::Failover || !self.config.failover_enabled {
            return None;
        }
        let mut after_failure = op.clone();
        after_failure.record_failure();
        if !after_failure.has_attempts_left() {
            return None;
        }

        let loads = async {
            let current = self.registry.get_current_host_loads(true).await?;
            let max = self.registry.get_max_loads().await?;
            Ok::<_, RegistryError>((current, max))
        }
        .await;

        match loads {
            Ok((current, max)) => {
                select_alternate_host(&current, &max, op.execution_host.as_deref())
            }
            Err(err) => {
                tracing::warn!(error = %err, "unable to load host capacity for failover");
                None
            }
        }
    }

    async fn update_backing_job(&self, transition: &JobTransition) {
        const ATTEMPTS: usize = 3;

        for _ in 0..ATTEMPTS {
            let mut job = match self.registry.get_job(transition.job_id).await {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(
                        job_id = %transition.job_id,
                        error = %err,
                        "unable to load operation job"
                    );
                    return;
                }
            };
            if job.status.is_terminal() || job.status == transition.status {
                return;
            }
            job.set_status(transition.status);
            match self.registry.update_job(job).await {
                Ok(_) => return,
                Err(RegistryError::StaleJob { .. }) => continue,
                Err(err) => {
                    tracing::warn!(
                        job_id = %transition.job_id,
                        error = %err,
                        "unable to update operation job"
                    );
                    return;
                }
            }
        }
    }

    async fn report_incident(
        &self,
        step: &Step,
        transition: Option<&JobTransition>,
        err: &OperationError,
    ) {
        let Some(transition) = transition else {
            tracing::error!(
                workflow_id = %step.workflow_id,
                template = %step.operation().template,
                error = %err,
                "operation failed without a backing job"
            );
            return;
        };
        let severity = if transition.status == JobStatus::Failed {
            Severity::Failure
        } else {
            Severity::Warning
        };
        match self.registry.get_job(transition.job_id).await {
            Ok(job) => self.incidents.unhandled_exception(&job, severity, err).await,
            Err(load_err) => tracing::warn!(
                job_id = %transition.job_id,
                error = %load_err,
                "unable to report incident"
            ),
        }
    }

    /// Cancel the children of `job_ids`, then the jobs themselves.
    async fn cancel_jobs(&self, job_ids: &[JobId]) {
        for &job_id in job_ids {
            match self.registry.child_jobs(job_id).await {
                Ok(children) => {
                    for child in children.iter().filter(|c| !c.status.is_terminal()) {
                        if let Err(err) = cancel_job(self.registry.as_ref(), child.id).await {
                            tracing::warn!(
                                job_id = %child.id,
                                error = %err,
                                "unable to cancel child job"
                            );
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%job_id, error = %err, "unable to list child jobs");
                }
            }
            if let Err(err) = cancel_job(self.registry.as_ref(), job_id).await {
                tracing::warn!(%job_id, error = %err, "unable to cancel operation job");
            }
        }
    }

    /// Delete `job_ids` and their children from the registry.
    async fn remove_jobs(&self, job_ids: &[JobId]) -> Result<(), RegistryError> {
        let mut doomed = Vec::new();
        for &job_id in job_ids {
            doomed.extend(self.registry.child_jobs(job_id).await?.into_iter().map(|c| c.id));
            doomed.push(job_id);
        }
        self.registry.remove_jobs(&doomed).await
    }
}
