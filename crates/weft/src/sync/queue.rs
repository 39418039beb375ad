// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Bounded async queue with terminal states.
//!
//! The queue is the hand-off between the transport reader (producer of
//! token events) and a generation consumer. Writers suspend when the queue
//! is full, which is how runtime output is backpressured all the way to the
//! child process pipe. Terminal rules:
//!
//! - `close()` ends the stream; readers drain remaining items then see
//!   end-of-stream. Multiple closes are no-ops.
//! - `fail(err)` ends the stream with an error; readers see the error
//!   immediately, remaining items are discarded, and writers suspended at
//!   that moment are rejected with the same error. The first terminal wins.
//! - Pushes after any terminal are dropped silently.

use crate::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
enum Terminal {
    Closed,
    Failed(EngineError),
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    terminal: Option<Terminal>,
    readers_waiting: usize,
    writers_waiting: usize,
}

/// Bounded multi-producer multi-consumer async queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    readable: Notify,
    writable: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                terminal: None,
                readers_waiting: 0,
                writers_waiting: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Maximum number of buffered items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a terminal transition has happened.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    /// Enqueue an item, suspending while the queue is full.
    ///
    /// Returns `Ok(true)` when the item was enqueued and `Ok(false)` when it
    /// was silently dropped because the queue had already terminated.
    ///
    /// # Errors
    ///
    /// Returns the failure error if `fail` terminates the queue while this
    /// writer is suspended.
    pub async fn push(&self, item: T) -> Result<bool> {
        let mut item = Some(item);
        let mut was_waiting = false;
        loop {
            {
                let mut inner = self.inner.lock();
                match &inner.terminal {
                    Some(Terminal::Closed) => return Ok(false),
                    Some(Terminal::Failed(err)) => {
                        // A writer that was parked when fail() hit is
                        // rejected; a late push just drops.
                        if was_waiting {
                            return Err(err.clone());
                        }
                        return Ok(false);
                    }
                    None => {}
                }
                if inner.items.len() < self.capacity {
                    if let Some(value) = item.take() {
                        inner.items.push_back(value);
                    }
                    drop(inner);
                    self.readable.notify_one();
                    return Ok(true);
                }
                inner.writers_waiting += 1;
            }
            was_waiting = true;
            self.writable.notified().await;
            self.inner.lock().writers_waiting -= 1;
        }
    }

    /// Enqueue without suspending.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` when dropped (terminal
    /// queue).
    ///
    /// # Errors
    ///
    /// Returns `Backpressure` when the queue is full.
    pub fn try_push(&self, item: T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return Ok(false);
        }
        if inner.items.len() >= self.capacity {
            return Err(EngineError::Backpressure("queue full".into()));
        }
        inner.items.push_back(item);
        drop(inner);
        self.readable.notify_one();
        Ok(true)
    }

    /// Dequeue the next item, suspending while the queue is empty.
    ///
    /// Returns `Ok(None)` once the queue is closed and drained.
    ///
    /// # Errors
    ///
    /// Returns the failure error after `fail`; buffered items are
    /// discarded.
    pub async fn shift(&self) -> Result<Option<T>> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(Terminal::Failed(err)) = &inner.terminal {
                    let err = err.clone();
                    inner.items.clear();
                    return Err(err);
                }
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.writable.notify_one();
                    return Ok(Some(item));
                }
                if matches!(inner.terminal, Some(Terminal::Closed)) {
                    return Ok(None);
                }
                inner.readers_waiting += 1;
            }
            self.readable.notified().await;
            self.inner.lock().readers_waiting -= 1;
        }
    }

    /// Close the queue: readers drain then see end-of-stream. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Closed);
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Fail the queue: readers see `err`, suspended writers are rejected.
    /// The first terminal transition wins; later calls are no-ops.
    pub fn fail(&self, err: EngineError) {
        {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Failed(err));
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Attempt to reset the queue for reuse by a pool.
    ///
    /// Fails (returning `false`) when any reader or writer is still parked
    /// on the queue; such a queue must be discarded, not reused. The reset
    /// sequence is ordered so a racing `push` observes a terminal queue
    /// rather than a half-cleared one: mark closed first, clear the buffer,
    /// reset the terminal flag last.
    #[must_use]
    pub fn try_reset(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.readers_waiting > 0 || inner.writers_waiting > 0 {
            return false;
        }
        inner.terminal = Some(Terminal::Closed);
        inner.items.clear();
        inner.terminal = None;
        true
    }
}
