// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Sliding windows over digests and counts.
//!
//! Both windows are rings of time buckets: whole buckets expire as the
//! window slides, which keeps eviction O(1) and makes the digest window
//! mergeable (a query merges the live buckets).

use crate::qos::tdigest::TDigest;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Buckets per window. More buckets sharpen expiry granularity at the cost
/// of merge work per query.
const BUCKETS_PER_WINDOW: u32 = 8;

/// Sliding-window quantile sketch.
#[derive(Debug)]
pub struct WindowedDigest {
    window: Duration,
    bucket_span: Duration,
    compression: f64,
    buckets: VecDeque<(Instant, TDigest)>,
}

impl WindowedDigest {
    /// Create a window of the given span.
    #[must_use]
    pub fn new(window: Duration, compression: f64) -> Self {
        let bucket_span = window / BUCKETS_PER_WINDOW;
        Self {
            window,
            bucket_span: bucket_span.max(Duration::from_millis(1)),
            compression,
            buckets: VecDeque::new(),
        }
    }

    /// Absorb one sample at the current time.
    pub fn record(&mut self, value: f64) {
        let now = Instant::now();
        self.expire(now);
        let needs_bucket = match self.buckets.back() {
            Some((start, _)) => now.duration_since(*start) >= self.bucket_span,
            None => true,
        };
        if needs_bucket {
            self.buckets.push_back((now, TDigest::new(self.compression)));
        }
        if let Some((_, digest)) = self.buckets.back_mut() {
            digest.add(value);
        }
    }

    /// Samples currently inside the window.
    #[must_use]
    pub fn count(&mut self) -> u64 {
        self.expire(Instant::now());
        self.buckets.iter().map(|(_, d)| d.count()).sum()
    }

    /// Quantile over the live window. `None` when empty.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        self.expire(Instant::now());
        let mut merged = TDigest::new(self.compression);
        for (_, digest) in &self.buckets {
            merged.merge(digest);
        }
        merged.quantile(q)
    }

    fn expire(&mut self, now: Instant) {
        while let Some((start, _)) = self.buckets.front() {
            if now.duration_since(*start) > self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window success/error counts.
#[derive(Debug)]
pub struct WindowedCounts {
    window: Duration,
    bucket_span: Duration,
    buckets: VecDeque<(Instant, u64, u64)>,
}

impl WindowedCounts {
    /// Create a window of the given span.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        let bucket_span = window / BUCKETS_PER_WINDOW;
        Self {
            window,
            bucket_span: bucket_span.max(Duration::from_millis(1)),
            buckets: VecDeque::new(),
        }
    }

    /// Record one observation.
    pub fn record(&mut self, is_error: bool) {
        let now = Instant::now();
        self.expire(now);
        let needs_bucket = match self.buckets.back() {
            Some((start, _, _)) => now.duration_since(*start) >= self.bucket_span,
            None => true,
        };
        if needs_bucket {
            self.buckets.push_back((now, 0, 0));
        }
        if let Some((_, total, errors)) = self.buckets.back_mut() {
            *total += 1;
            if is_error {
                *errors += 1;
            }
        }
    }

    /// `(total, errors)` inside the live window.
    #[must_use]
    pub fn totals(&mut self) -> (u64, u64) {
        self.expire(Instant::now());
        self.buckets
            .iter()
            .fold((0, 0), |(t, e), (_, total, errors)| (t + total, e + errors))
    }

    /// Errors over total, 0.0 when empty.
    #[must_use]
    pub fn error_rate(&mut self) -> f64 {
        let (total, errors) = self.totals();
        crate::sync::math::ratio(errors, total)
    }

    fn expire(&mut self, now: Instant) {
        while let Some((start, _, _)) = self.buckets.front() {
            if now.duration_since(*start) > self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}
