//! Cooperative cancellation shared by the connection tasks.

use std::sync::Arc;
use tokio::sync::watch;

/// Latched cancellation flag. Cloning shares the flag; any clone can cancel.
///
/// Every long-running task selects on [`cancelled`](Self::cancelled) at its
/// suspension points and exits without holding resources.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Child token: cancelled when either the parent or the child fires.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let parent = self.clone();
        let handle = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => handle.cancel(),
                _ = handle.cancelled() => {}
            }
        });
        child
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives in `self`, so `changed` cannot fail here.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
