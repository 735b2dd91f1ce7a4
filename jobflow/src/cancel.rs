use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cloneable cancellation signal shared by a workflow task and whatever it is
/// waiting on.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

#[derive(Debug, Default)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not lost.
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
