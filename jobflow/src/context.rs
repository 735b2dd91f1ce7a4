//! Task-scoped execution context.
//!
//! Every job runner and workflow task installs an [`ExecutionContext`] for the
//! duration of its work. The context lives in a tokio task-local, so two
//! runners never observe each other's identity, and it is released when the
//! scoped future completes, fails or is dropped.

use std::future::Future;

use crate::identity::{Organization, User};
use crate::job::JobId;

tokio::task_local! {
    static EXECUTION_CONTEXT: ExecutionContext;
}

/// Identity and job lineage active on the current task.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionContext {
    pub organization: Organization,
    pub user: User,
    /// Job being processed; new jobs created in this scope become its children.
    pub current_job: Option<JobId>,
    /// Job that was current when `current_job` was admitted.
    pub submitted_by: Option<JobId>,
}

impl ExecutionContext {
    pub fn new(organization: Organization, user: User) -> Self {
        Self {
            organization,
            user,
            current_job: None,
            submitted_by: None,
        }
    }

    pub fn with_current_job(mut self, job: Option<JobId>) -> Self {
        self.current_job = job;
        self
    }

    pub fn with_submitted_by(mut self, job: Option<JobId>) -> Self {
        self.submitted_by = job;
        self
    }

    /// Run `future` with this context installed.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        EXECUTION_CONTEXT.scope(self, future).await
    }

    /// Context installed on the calling task, if any.
    pub fn current() -> Option<ExecutionContext> {
        EXECUTION_CONTEXT.try_with(Clone::clone).ok()
    }

    /// The calling task's current job marker.
    pub fn current_job_id() -> Option<JobId> {
        EXECUTION_CONTEXT
            .try_with(|ctx| ctx.current_job)
            .ok()
            .flatten()
    }
}
