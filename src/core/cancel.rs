//! Cancellation plumbing for in-flight requests.
//!
//! A [`CancelHandle`] is created per request and threaded into the route
//! state machine and dispatcher. Client disconnect or the outer deadline
//! fires it; a normally-finished request marks itself completed first so a
//! late disconnect is not mistaken for a cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Handle for cancelling downstream work when the caller goes away.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    completed: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the request as completed normally. Subsequent `cancel` calls
    /// become no-ops.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Signal cancellation unless the request already completed.
    pub fn cancel(&self) {
        if !self.is_completed() {
            let _ = self.sender.send(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve when cancellation fires; for use inside `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.receiver.clone();
        if *rx.borrow() {
            return;
        }
        // Channel closure means the handle owner is gone, treat as cancel.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
