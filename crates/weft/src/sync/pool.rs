// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Generic resource pool with a reset discipline.
//!
//! Motivated by per-request allocation cost on the generate path: stream
//! queues are pooled instead of allocated per call. A released resource is
//! reset before it becomes available again; a resource whose reset fails,
//! or that is still referenced elsewhere, is discarded rather than reused.

use parking_lot::Mutex;
use std::sync::Arc;

/// Pool of reusable `Arc`-wrapped resources.
pub struct ResourcePool<T> {
    available: Mutex<Vec<Arc<T>>>,
    max_idle: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> ResourcePool<T> {
    /// Create a pool keeping at most `max_idle` reset resources around.
    ///
    /// `factory` builds fresh resources; `reset` returns whether a released
    /// resource is safe to reuse.
    pub fn new(
        max_idle: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            available: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            factory: Box::new(factory),
            reset: Box::new(reset),
        }
    }

    /// Take a resource from the pool, building one if none is idle.
    #[must_use]
    pub fn acquire(&self) -> Arc<T> {
        if let Some(resource) = self.available.lock().pop() {
            return resource;
        }
        Arc::new((self.factory)())
    }

    /// Return a resource to the pool.
    ///
    /// The resource is discarded when other references to it are still
    /// alive (reuse would alias live consumers), when its reset reports
    /// failure, or when the pool is already at `max_idle`.
    pub fn release(&self, resource: Arc<T>) {
        if Arc::strong_count(&resource) != 1 {
            return;
        }
        if !(self.reset)(&resource) {
            return;
        }
        let mut available = self.available.lock();
        if available.len() < self.max_idle {
            available.push(resource);
        }
    }

    /// Idle resources currently pooled.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.available.lock().len()
    }
}

impl<T> std::fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("max_idle", &self.max_idle)
            .field("idle", &self.idle())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::queue::BoundedQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_acquire_reuses_released() {
        let built = Arc::new(AtomicUsize::new(0));
        let built2 = Arc::clone(&built);
        let pool = ResourcePool::new(
            4,
            move || {
                built2.fetch_add(1, Ordering::SeqCst);
                42u32
            },
            |_| true,
        );

        let a = pool.acquire();
        pool.release(a);
        let _b = pool.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 1, "release should be reused");
    }

    #[test]
    fn test_release_discards_on_failed_reset() {
        let pool = ResourcePool::new(4, || 0u32, |_| false);
        let a = pool.acquire();
        pool.release(a);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_release_discards_aliased_resource() {
        let pool = ResourcePool::new(4, || 0u32, |_| true);
        let a = pool.acquire();
        let alias = Arc::clone(&a);
        pool.release(a);
        assert_eq!(pool.idle(), 0, "aliased resource must not be pooled");
        drop(alias);
    }

    #[test]
    fn test_max_idle_bounds_pool() {
        let pool = ResourcePool::new(1, || 0u32, |_| true);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_pooled_queue_reset_between_uses() {
        let pool = ResourcePool::new(2, || BoundedQueue::<u32>::new(4), BoundedQueue::try_reset);

        let queue = pool.acquire();
        queue.push(7).await.unwrap();
        queue.close();
        pool.release(queue);

        // The reused queue starts fresh: no items, not terminal.
        let queue = pool.acquire();
        assert!(queue.is_empty());
        assert!(!queue.is_terminal());
    }
}
