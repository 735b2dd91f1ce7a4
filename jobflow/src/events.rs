use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::JobId;
use crate::workflow::{OperationState, WorkflowId, WorkflowState};

/// Metadata envelope attached to every workflow event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            workflow_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub meta: EventMeta,
    pub payload: WorkflowEventPayload,
}

impl WorkflowEvent {
    pub fn new(workflow_id: WorkflowId, payload: WorkflowEventPayload) -> Self {
        Self {
            meta: EventMeta::new(workflow_id),
            payload,
        }
    }
}

/// Event payload emitted for workflow transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WorkflowEventPayload {
    StateChanged {
        from: WorkflowState,
        to: WorkflowState,
    },
    OperationChanged {
        index: usize,
        template: String,
        state: OperationState,
        job_id: Option<JobId>,
    },
    /// The instance was deleted from the service.
    Removed,
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process fan-out bus for [`WorkflowEvent`]s.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
pub struct WorkflowEventBus {
    sender: broadcast::Sender<WorkflowEvent>,
    capacity: usize,
}

impl std::fmt::Debug for WorkflowEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl WorkflowEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers. Dropped silently when there are
    /// none.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl EventPublisher<WorkflowEvent> for WorkflowEventBus {
    async fn publish(&self, event: WorkflowEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }
}

impl EventSubscriber<WorkflowEvent> for WorkflowEventBus {
    fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}
