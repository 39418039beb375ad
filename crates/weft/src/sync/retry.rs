// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Retry with capped exponential backoff.
//!
//! Classification is by error code first, then a short list of message
//! heuristics for errors that arrive without a useful code. An abort signal
//! cancels mid-sleep; an aborted retry is never itself retryable.

use crate::errors::{EngineError, Result};
use crate::sync::abort::AbortSignal;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Substrings that mark an uncoded error as transient.
const TRANSIENT_MESSAGE_MARKERS: &[&str] = &[
    "connection reset",
    "broken pipe",
    "temporarily unavailable",
    "try again",
];

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Randomize each delay within [50%, 100%] to avoid thundering herds.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let raw = self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let millis = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

/// Whether `err` is worth retrying.
///
/// Aborts are final regardless of message content.
#[must_use]
pub fn is_transient(err: &EngineError) -> bool {
    if matches!(err, EngineError::Aborted(_)) {
        return false;
    }
    if err.is_retryable() {
        return true;
    }
    let message = err.to_string().to_lowercase();
    TRANSIENT_MESSAGE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Run `op` until it succeeds, the attempt budget is spent, or a
/// non-transient error appears.
///
/// `op` receives the 0-based attempt index. The abort signal is honoured
/// both between attempts and during backoff sleeps.
///
/// # Errors
///
/// Returns the last attempt's error, or `Aborted` when the signal trips.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &Backoff,
    signal: Option<&AbortSignal>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_err = EngineError::Generation("retry budget was zero".into());

    for attempt in 0..attempts {
        if let Some(signal) = signal {
            if signal.is_aborted() {
                return Err(EngineError::Aborted("retry aborted".into()));
            }
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let final_attempt = attempt + 1 == attempts;
                if final_attempt || !is_transient(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                last_err = err;

                match signal {
                    Some(signal) => {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = signal.cancelled() => {
                                return Err(EngineError::Aborted("retry aborted".into()));
                            }
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }

    Err(last_err)
}
