//! Cooperative cancellation handles.
//!
//! A [`Shutdown`] is a cloneable cancellation flag built on a
//! `tokio::sync::watch` channel. Any clone may cancel; every clone can
//! await cancellation. Watchers hold one while running and exit when it
//! fires; owners keep a [`ShutdownGuard`] so the watcher is always
//! released on scope exit.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, idempotent cancellation handle.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel. Safe to call any number of times, from any clone.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`Shutdown::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancelled. Resolves immediately if already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            // the sender lives in self, so changed() cannot fail here
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A guard that cancels this handle when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard(self.clone())
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels the wrapped [`Shutdown`] on drop.
#[derive(Debug)]
pub struct ShutdownGuard(Shutdown);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_unblocks_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock")
            .expect("waiter task");
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_after_cancel() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_millis(100), shutdown.cancelled())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn test_guard_cancels_on_drop() {
        let shutdown = Shutdown::new();
        {
            let _guard = shutdown.guard();
            assert!(!shutdown.is_cancelled());
        }
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_uncancelled_stays_pending() {
        let shutdown = Shutdown::new();
        let result =
            tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled()).await;
        assert!(result.is_err());
    }
}
