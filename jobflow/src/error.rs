use thiserror::Error;

use crate::job::{JobId, JobStatus};
use crate::workflow::{WorkflowId, WorkflowState};

/// Failures reported by the service registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("host {0} is not registered")]
    HostNotFound(String),

    #[error("stale update of job {job_id}: expected version {expected}, stored version {actual}")]
    StaleJob {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },

    #[error("illegal transition of job {job_id} from {from} to {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("service registry unavailable: {0}")]
    Unavailable(String),
}

/// Failures resolving organizations or users.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("organization {0} not found")]
    OrganizationNotFound(String),

    #[error("user {user} not found in organization {organization}")]
    UserNotFound { user: String, organization: String },
}

/// Outcome of a producer's processing function that did not succeed.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Cooperative cancellation. The canceller owns the final job state.
    #[error("job {0} was canceled")]
    Canceled(JobId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessingError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, ProcessingError::Canceled(_))
    }
}

/// Failures while admitting a job onto this node.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The RUNNING transition could not be persisted; cluster bookkeeping and
    /// the local view would disagree, so the job is not started.
    #[error("failed to persist RUNNING state of job {job_id}")]
    PersistRunning {
        job_id: JobId,
        #[source]
        source: RegistryError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failure raised by a workflow operation handler.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The workflow was stopped or paused while the operation waited.
    #[error("operation canceled")]
    Canceled,

    #[error("job {job_id} ended in state {status}")]
    JobFailed { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OperationError {
    /// Shorthand for an opaque failure with a message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        OperationError::Other(anyhow::anyhow!("{message}"))
    }
}

/// Failures of workflow service calls.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {0} not found")]
    NotFound(WorkflowId),

    #[error("workflow definition {0} not found")]
    DefinitionNotFound(String),

    #[error("no handler registered for operation template {0}")]
    HandlerNotFound(String),

    #[error("workflow {id} is {state}; cannot {action}")]
    InvalidState {
        id: WorkflowId,
        state: WorkflowState,
        action: &'static str,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
