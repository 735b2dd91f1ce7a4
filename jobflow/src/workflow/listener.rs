use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use super::instance::{WorkflowId, WorkflowInstance, WorkflowOperationInstance, WorkflowState};

/// Observer of workflow transitions.
///
/// Callbacks run on the engine task that caused the transition, after the
/// new state is stored. They must not block.
pub trait WorkflowListener: Send + Sync {
    fn state_changed(&self, _workflow: &WorkflowInstance) {}

    fn operation_changed(
        &self,
        _workflow: &WorkflowInstance,
        _operation: &WorkflowOperationInstance,
    ) {
    }
}

/// Handle returned by [`super::WorkflowService::add_listener`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn WorkflowListener>)>>,
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("count", &self.listeners.read().len())
            .finish()
    }
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn WorkflowListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<dyn WorkflowListener>> {
        self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub(crate) fn state_changed(&self, workflow: &WorkflowInstance) {
        for listener in self.snapshot() {
            listener.state_changed(workflow);
        }
    }

    pub(crate) fn operation_changed(
        &self,
        workflow: &WorkflowInstance,
        operation: &WorkflowOperationInstance,
    ) {
        for listener in self.snapshot() {
            listener.operation_changed(workflow, operation);
        }
    }
}

/// Listener recording which workflows reached a set of states.
///
/// Useful for waiting on workflows in tests and tooling.
pub struct WorkflowStateListener {
    states: HashSet<WorkflowState>,
    reached: Mutex<HashMap<WorkflowId, WorkflowState>>,
    counts: Mutex<HashMap<WorkflowState, usize>>,
    notify: Notify,
}

impl fmt::Debug for WorkflowStateListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStateListener")
            .field("states", &self.states)
            .field("reached", &self.reached.lock().len())
            .finish()
    }
}

impl WorkflowStateListener {
    pub fn new(states: impl IntoIterator<Item = WorkflowState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            reached: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Listener for every terminal state.
    pub fn terminal() -> Self {
        Self::new([WorkflowState::Succeeded, WorkflowState::Failed, WorkflowState::Stopped])
    }

    /// Number of transitions into `state` observed so far.
    pub fn count(&self, state: WorkflowState) -> usize {
        self.counts.lock().get(&state).copied().unwrap_or(0)
    }

    /// Total transitions into any watched state.
    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }

    /// The watched state `id` most recently entered.
    pub fn state_of(&self, id: WorkflowId) -> Option<WorkflowState> {
        self.reached.lock().get(&id).copied()
    }

    /// Forget what was recorded for `id`.
    pub fn reset(&self, id: WorkflowId) {
        self.reached.lock().remove(&id);
    }

    /// Wait until `id` enters a watched state, or `timeout` elapses.
    pub async fn wait_for(&self, id: WorkflowId, timeout: Duration) -> Option<WorkflowState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(state) = self.state_of(id) {
                return Some(state);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.state_of(id);
            }
        }
    }

    /// Wait until `expected` transitions into watched states were seen.
    pub async fn wait_for_total(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.total() >= expected {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.total() >= expected;
            }
        }
    }
}

impl WorkflowListener for WorkflowStateListener {
    fn state_changed(&self, workflow: &WorkflowInstance) {
        if !self.states.contains(&workflow.state) {
            return;
        }
        self.reached.lock().insert(workflow.id, workflow.state);
        *self.counts.lock().entry(workflow.state).or_insert(0) += 1;
        self.notify.notify_waiters();
    }
}
