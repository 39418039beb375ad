// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! One-shot abort signalling.
//!
//! A cheap clone-able signal consumers can select against. Dropping the
//! handle without aborting leaves the signal permanently unset.

use tokio::sync::watch;

/// Create a connected handle/signal pair.
#[must_use]
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Producer side: call [`AbortHandle::abort`] once to trip every signal.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Trip the signal. Idempotent.
    pub fn abort(&self) {
        // send only fails when every receiver is gone, which is fine.
        let _ = self.tx.send(true);
    }

    /// Whether the signal has been tripped.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Consumer side: poll or await the abort.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Whether the signal has been tripped.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal trips. Never resolves if the handle was
    /// dropped without aborting.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without aborting: park forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_wakes_waiter() {
        let (handle, signal) = abort_pair();
        let waiter = tokio::spawn(async move { signal.cancelled().await });
        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let (handle, signal) = abort_pair();
        handle.abort();
        handle.abort();
        assert!(signal.is_aborted());
        // Already-tripped signal resolves immediately.
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_never_resolves() {
        let (handle, signal) = abort_pair();
        drop(handle);
        let result =
            tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(result.is_err(), "dropped handle must not read as abort");
    }
}
