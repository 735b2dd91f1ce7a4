use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Unique identifier of a job, assigned by the service registry at creation.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Lifecycle states of a job.
///
/// The admission pipeline moves a job `Instantiated -> Queued -> Dispatching
/// -> Running` and the runner finishes it as `Finished` or `Failed`. A running
/// job may pass through `Retry` before running again. `Canceled` is set by
/// whoever cancels the job, never by the runner.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Instantiated,
    Queued,
    Dispatching,
    Running,
    Retry,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Instantiated => "INSTANTIATED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Dispatching => "DISPATCHING",
            JobStatus::Running => "RUNNING",
            JobStatus::Retry => "RETRY",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    /// Whether no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether the job currently contributes to its host's load.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Dispatching | JobStatus::Running | JobStatus::Retry
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Canceled) => !self.is_terminal(),
            (Instantiated, Queued | Dispatching) => true,
            (Queued, Dispatching) => true,
            (Dispatching, Queued | Running) => true,
            (Running, Retry | Finished | Failed) => true,
            (Retry, Running | Failed) => true,
            _ => false,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An asynchronous unit of work tracked by the service registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Optimistic concurrency version, bumped by every registry update.
    pub version: u64,
    /// Tag identifying the producer responsible for this job.
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub status: JobStatus,
    /// Declared load weight, never negative.
    pub job_load: f32,
    pub creator: String,
    pub organization: String,
    /// Result of a successful run.
    pub payload: Option<String>,
    /// Host the job was last dispatched to.
    pub processing_host: Option<String>,
    /// Relation only; the parent does not own this job.
    pub parent_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh, not yet persisted job.
    pub fn new(
        job_type: impl Into<String>,
        operation: impl Into<String>,
        arguments: Vec<String>,
        job_load: f32,
    ) -> Self {
        Self {
            id: JobId::new(),
            version: 0,
            job_type: job_type.into(),
            operation: operation.into(),
            arguments,
            status: JobStatus::Instantiated,
            job_load: job_load.max(0.0),
            creator: String::new(),
            organization: String::new(),
            payload: None,
            processing_host: None,
            parent_job_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_identity(
        mut self,
        creator: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        self.creator = creator.into();
        self.organization = organization.into();
        self
    }

    pub fn with_parent(mut self, parent: Option<JobId>) -> Self {
        self.parent_job_id = parent;
        self
    }

    /// Set the status and stamp the matching timestamp.
    pub fn set_status(&mut self, status: JobStatus) {
        let now = Utc::now();
        match status {
            JobStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now)
            }
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = status;
    }
}

/// Parameters for [`crate::registry::ServiceRegistry::create_job`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub job_load: f32,
    pub parent_job_id: Option<JobId>,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        operation: impl Into<String>,
        arguments: Vec<String>,
        job_load: f32,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            operation: operation.into(),
            arguments,
            job_load,
            parent_job_id: None,
        }
    }

    pub fn with_parent(mut self, parent: Option<JobId>) -> Self {
        self.parent_job_id = parent;
        self
    }
}
