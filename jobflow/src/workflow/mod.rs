//! Workflow engine: definitions, running instances and their operations.

mod barrier;
mod builder;
mod definition;
mod handler;
mod instance;
mod listener;
mod query;
mod service;

pub use barrier::{BarrierResult, JobBarrier};
pub use builder::WorkflowServiceBuilder;
pub use definition::{OperationDefinition, RetryStrategy, WorkflowDefinition};
pub use handler::{
    Action, ERROR_RESOLUTION_HANDLER_ID, ErrorResolutionHandler, HandlerRegistry, OperationContext,
    OperationResult, WorkflowOperationHandler,
};
pub use instance::{
    MediaPackage, OperationState, UNBOUNDED_ATTEMPTS, WorkflowId, WorkflowInstance,
    WorkflowOperationInstance, WorkflowState,
};
pub use listener::{ListenerId, WorkflowListener, WorkflowStateListener};
pub use query::{WorkflowQuery, WorkflowSet, WorkflowStatistics};
pub use service::{
    FAILED_OPERATION_KEY, RESUME_OPERATION, START_OPERATION, WORKFLOW_JOB_TYPE, WorkflowService,
};
