// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Timer guards.
//!
//! A [`TimerGuard`] owns at most one pending timer: setting a new one
//! clears the previous, and dropping the guard clears whatever is pending,
//! so a guard can never leak timers. [`NamedTimerGuard`] keys independent
//! slots by name with the same rules per slot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Single-slot timer guard.
#[derive(Debug, Default)]
pub struct TimerGuard {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending one.
    pub fn set<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        let mut slot = self.handle.lock();
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Cancel the pending timer, if any. Idempotent.
    pub fn clear(&self) {
        if let Some(task) = self.handle.lock().take() {
            task.abort();
        }
    }

    /// Whether a timer is pending (armed and not yet fired).
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Multi-slot timer guard keyed by name.
#[derive(Debug, Default)]
pub struct NamedTimerGuard {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl NamedTimerGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the named slot, replacing any pending timer under that name.
    pub fn set<F>(&self, name: &str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        let mut timers = self.timers.lock();
        if let Some(previous) = timers.insert(name.to_string(), task) {
            previous.abort();
        }
    }

    /// Cancel the named slot. Idempotent; unknown names are no-ops.
    pub fn clear(&self, name: &str) {
        if let Some(task) = self.timers.lock().remove(name) {
            task.abort();
        }
    }

    /// Cancel every slot.
    pub fn clear_all(&self) {
        let mut timers = self.timers.lock();
        for (_, task) in timers.drain() {
            task.abort();
        }
    }

    /// Number of armed, unfired timers. Fired slots are pruned.
    #[must_use]
    pub fn active(&self) -> usize {
        let mut timers = self.timers.lock();
        timers.retain(|_, task| !task.is_finished());
        timers.len()
    }
}

impl Drop for NamedTimerGuard {
    fn drop(&mut self) {
        self.clear_all();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_timer_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let guard = TimerGuard::new();
        guard.set(Duration::from_millis(10), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!guard.is_armed());
    }

    #[tokio::test]
    async fn test_set_replaces_previous() {
        let fired = Arc::new(AtomicUsize::new(0));
        let guard = TimerGuard::new();
        for _ in 0..5 {
            let fired2 = Arc::clone(&fired);
            guard.set(Duration::from_millis(30), move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only the last armed timer may fire.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent_and_leaks_nothing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let guard = TimerGuard::new();
        guard.set(Duration::from_millis(20), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        guard.clear();
        guard.clear();
        assert!(!guard.is_armed());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_named_slots_are_independent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let guard = NamedTimerGuard::new();

        let fired_a = Arc::clone(&fired);
        guard.set("a", Duration::from_millis(10), move || {
            fired_a.fetch_add(1, Ordering::SeqCst);
        });
        let fired_b = Arc::clone(&fired);
        guard.set("b", Duration::from_millis(10), move || {
            fired_b.fetch_add(10, Ordering::SeqCst);
        });
        guard.clear("a");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert_eq!(guard.active(), 0);
    }

    #[tokio::test]
    async fn test_drop_clears_pending() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired2 = Arc::clone(&fired);
            let guard = TimerGuard::new();
            guard.set(Duration::from_millis(20), move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
