use std::collections::BTreeMap;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;

use super::definition::{OperationDefinition, RetryStrategy};

/// Sentinel for an operation that may be retried without limit.
pub const UNBOUNDED_ATTEMPTS: i32 = -1;

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct WorkflowId(pub Uuid);

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WorkflowId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Instantiated,
    Running,
    Stopped,
    Paused,
    Succeeded,
    /// An operation failed; only error-handling operations still run.
    Failing,
    Failed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 7] = [
        WorkflowState::Instantiated,
        WorkflowState::Running,
        WorkflowState::Stopped,
        WorkflowState::Paused,
        WorkflowState::Succeeded,
        WorkflowState::Failing,
        WorkflowState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Instantiated => "INSTANTIATED",
            WorkflowState::Running => "RUNNING",
            WorkflowState::Stopped => "STOPPED",
            WorkflowState::Paused => "PAUSED",
            WorkflowState::Succeeded => "SUCCEEDED",
            WorkflowState::Failing => "FAILING",
            WorkflowState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Stopped | WorkflowState::Succeeded | WorkflowState::Failed
        )
    }

    /// Whether the engine may advance the workflow to its next operation.
    pub fn accepts_advancement(&self) -> bool {
        matches!(
            self,
            WorkflowState::Instantiated | WorkflowState::Running | WorkflowState::Failing
        )
    }
}

impl Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Instantiated,
    Running,
    Paused,
    Succeeded,
    Failed,
    /// Failed and waiting to be run again.
    Retry,
    Skipped,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Instantiated => "INSTANTIATED",
            OperationState::Running => "RUNNING",
            OperationState::Paused => "PAUSED",
            OperationState::Succeeded => "SUCCEEDED",
            OperationState::Failed => "FAILED",
            OperationState::Retry => "RETRY",
            OperationState::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Skipped
        )
    }
}

impl Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The media package a workflow processes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaPackage {
    pub id: String,
    pub title: Option<String>,
    pub series_title: Option<String>,
    pub creators: Vec<String>,
    pub contributors: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// Element references (tracks, catalogs, attachments).
    pub elements: Vec<String>,
}

impl MediaPackage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creators.push(creator.into());
        self
    }

    pub fn with_contributor(mut self, contributor: impl Into<String>) -> Self {
        self.contributors.push(contributor.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_element(mut self, element: impl Into<String>) -> Self {
        self.elements.push(element.into());
        self
    }

    /// Searchable text fields: id, titles, people and metadata values.
    pub fn text_fields(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str())
            .chain(self.title.as_deref())
            .chain(self.series_title.as_deref())
            .chain(self.creators.iter().map(String::as_str))
            .chain(self.contributors.iter().map(String::as_str))
            .chain(self.metadata.values().map(String::as_str))
    }
}

/// One step of a running workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOperationInstance {
    /// Template name selecting the handler.
    pub template: String,
    pub description: Option<String>,
    pub state: OperationState,
    pub retry_strategy: RetryStrategy,
    /// [`UNBOUNDED_ATTEMPTS`] means no limit.
    pub max_attempts: i32,
    pub failed_attempts: u32,
    pub fail_on_error: bool,
    pub exception_handler_workflow: Option<String>,
    /// Host the operation ran, or is routed to after a failover.
    pub execution_host: Option<String>,
    pub configuration: BTreeMap<String, String>,
    /// Backing job tracking this operation in the registry.
    pub job_id: Option<JobId>,
    /// Inserted from an error-handler definition.
    pub error_path: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowOperationInstance {
    pub fn new(template: impl Into<String>) -> Self {
        Self::from_definition(&OperationDefinition::new(template))
    }

    pub fn from_definition(definition: &OperationDefinition) -> Self {
        Self {
            template: definition.id.clone(),
            description: definition.description.clone(),
            state: OperationState::Instantiated,
            retry_strategy: definition.retry_strategy,
            max_attempts: definition.effective_max_attempts(),
            failed_attempts: 0,
            fail_on_error: definition.fail_on_error,
            exception_handler_workflow: definition.exception_handler_workflow.clone(),
            execution_host: None,
            configuration: definition.configuration.clone(),
            job_id: None,
            error_path: false,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn has_unbounded_attempts(&self) -> bool {
        self.max_attempts == UNBOUNDED_ATTEMPTS
    }

    /// Whether another attempt is allowed after the failures recorded so far.
    pub fn has_attempts_left(&self) -> bool {
        self.has_unbounded_attempts() || (self.failed_attempts as i64) < self.max_attempts as i64
    }

    /// Count a failed attempt without exceeding the bound.
    pub fn record_failure(&mut self) {
        if self.has_attempts_left() {
            self.failed_attempts += 1;
        }
    }

    pub fn configuration(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).map(String::as_str)
    }
}

/// A running (or finished) execution of a workflow definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub title: Option<String>,
    /// Id of the definition the instance was started from.
    pub template: String,
    pub state: WorkflowState,
    pub parent_id: Option<WorkflowId>,
    pub creator: String,
    pub organization: String,
    pub media_package: MediaPackage,
    pub configuration: BTreeMap<String, String>,
    pub operations: Vec<WorkflowOperationInstance>,
    /// Index of the current operation; equals `operations.len()` once the
    /// list has been worked off.
    pub cursor: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn current_operation(&self) -> Option<&WorkflowOperationInstance> {
        self.operations.get(self.cursor)
    }

    pub fn current_operation_mut(&mut self) -> Option<&mut WorkflowOperationInstance> {
        self.operations.get_mut(self.cursor)
    }

    pub fn operation_templates(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.template.as_str()).collect()
    }

    pub fn configuration(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).map(String::as_str)
    }

    /// Backing job ids of every operation that has run.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.operations.iter().filter_map(|op| op.job_id).collect()
    }

    pub(crate) fn set_state(&mut self, state: WorkflowState) {
        if state.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self.state = state;
    }
}
