//! Cooperative cancellation for a session's long-running operation.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::progress::ProgressCallback;

/// Cancellation signal shared by everything running "as" one session.
///
/// Two sources can stop an operation: an explicit [`cancel`](Self::cancel)
/// (registry shutdown paths) and the user-facing callback's
/// `is_cancelled()` predicate, once [`observe`](Self::observe)d.
pub struct OperationControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    observed: RwLock<Option<Arc<dyn ProgressCallback>>>,
}

impl OperationControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
            observed: RwLock::new(None),
        }
    }

    /// Also treat `callback.is_cancelled()` as a cancellation request.
    pub fn observe(&self, callback: Arc<dyn ProgressCallback>) {
        *self.observed.write() = Some(callback);
    }

    pub fn is_cancelled(&self) -> bool {
        if *self.cancel_rx.borrow() {
            return true;
        }
        self.observed
            .read()
            .as_ref()
            .is_some_and(|cb| cb.is_cancelled())
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Get a receiver for waiting on explicit cancellation
    pub fn subscribe_cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

impl Default for OperationControl {
    fn default() -> Self {
        Self::new()
    }
}
