// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Async primitives shared across the orchestration core.
//!
//! Everything here is deliberately small and allocation-conscious: these
//! types sit on the per-token hot path.

pub mod abort;
pub mod math;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod timer;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use pool::ResourcePool;
pub use queue::BoundedQueue;
pub use retry::{retry_with_backoff, Backoff};
pub use timer::{NamedTimerGuard, TimerGuard};
