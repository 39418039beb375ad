// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Compact mergeable quantile sketch (t-digest).
//!
//! Centroids concentrate toward the tails, so extreme percentiles stay
//! accurate while memory stays bounded by the compression factor. Inserts
//! land in a buffer that is merged and compressed once it fills; merging
//! two digests is buffer concatenation followed by the same compression.

use std::collections::VecDeque;

/// Default compression factor. Roughly bounds the centroid count and sets
/// tail accuracy; 100 keeps p99 error well under 1% on realistic latency
/// distributions.
pub const DEFAULT_COMPRESSION: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// A t-digest over `f64` samples.
#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<Centroid>,
    count: f64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

impl TDigest {
    /// Create a digest with the given compression factor.
    #[must_use]
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(10.0),
            centroids: Vec::new(),
            buffer: Vec::new(),
            count: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Number of samples absorbed.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count as u64
    }

    /// Whether the digest holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }

    /// Smallest sample seen.
    #[must_use]
    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    /// Largest sample seen.
    #[must_use]
    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }

    /// Absorb one sample.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.buffer.push(Centroid {
            mean: value,
            weight: 1.0,
        });
        self.count += 1.0;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.buffer.len() >= (8.0 * self.compression) as usize {
            self.compress();
        }
    }

    /// Absorb another digest.
    pub fn merge(&mut self, other: &TDigest) {
        if other.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(&other.centroids);
        self.buffer.extend_from_slice(&other.buffer);
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.compress();
    }

    /// Estimate the `q`-quantile (`q` in `[0, 1]`). `None` when empty.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        self.compress();
        let q = q.clamp(0.0, 1.0);
        let target = q * self.count;

        // Walk cumulative weight; interpolate between centroid midpoints.
        let mut cumulative = 0.0;
        for (index, centroid) in self.centroids.iter().enumerate() {
            let mid = cumulative + centroid.weight / 2.0;
            if target <= mid {
                if index == 0 {
                    let prev_mid = 0.0;
                    let span = mid - prev_mid;
                    if span <= 0.0 {
                        return Some(centroid.mean.max(self.min));
                    }
                    let fraction = (target - prev_mid) / span;
                    return Some(self.min + fraction * (centroid.mean - self.min));
                }
                let prev = self.centroids[index - 1];
                let prev_mid = cumulative - prev.weight / 2.0;
                let span = mid - prev_mid;
                if span <= 0.0 {
                    return Some(centroid.mean);
                }
                let fraction = (target - prev_mid) / span;
                return Some(prev.mean + fraction * (centroid.mean - prev.mean));
            }
            cumulative += centroid.weight;
        }
        Some(self.max)
    }

    fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut all: Vec<Centroid> = Vec::with_capacity(self.centroids.len() + self.buffer.len());
        all.append(&mut self.centroids);
        all.append(&mut self.buffer);
        all.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total: f64 = all.iter().map(|c| c.weight).sum();
        let mut compressed: Vec<Centroid> = Vec::new();
        let mut pending: VecDeque<Centroid> = all.into();
        let Some(mut current) = pending.pop_front() else {
            return;
        };
        let mut cumulative = 0.0;

        for next in pending {
            let merged_weight = current.weight + next.weight;
            let q_mid = (cumulative + merged_weight / 2.0) / total;
            // The classic k1 size bound: centroids may be fat in the middle
            // of the distribution and must stay thin at the tails.
            let limit = 4.0 * total * q_mid * (1.0 - q_mid) / self.compression;
            if merged_weight <= limit.max(1.0) {
                current.mean = (current.mean * current.weight + next.mean * next.weight)
                    / merged_weight;
                current.weight = merged_weight;
            } else {
                cumulative += current.weight;
                compressed.push(current);
                current = next;
            }
        }
        compressed.push(current);
        self.centroids = compressed;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest() {
        let mut digest = TDigest::default();
        assert!(digest.is_empty());
        assert_eq!(digest.quantile(0.5), None);
        assert_eq!(digest.min(), None);
    }

    #[test]
    fn test_single_value() {
        let mut digest = TDigest::default();
        digest.add(42.0);
        assert_eq!(digest.count(), 1);
        assert!((digest.quantile(0.5).unwrap() - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_uniform_percentiles_within_one_percent() {
        let mut digest = TDigest::default();
        for i in 0..10_000 {
            digest.add(i as f64);
        }
        for (q, expected) in [(0.5, 5_000.0), (0.95, 9_500.0), (0.99, 9_900.0)] {
            let estimate = digest.quantile(q).unwrap();
            let error = (estimate - expected).abs() / 10_000.0;
            assert!(
                error < 0.01,
                "q={q}: estimate {estimate} vs {expected} (error {error})"
            );
        }
        assert_eq!(digest.min().unwrap(), 0.0);
        assert_eq!(digest.max().unwrap(), 9_999.0);
    }

    #[test]
    fn test_bounded_memory() {
        let mut digest = TDigest::new(100.0);
        for i in 0..100_000 {
            digest.add((i % 1000) as f64);
        }
        digest.quantile(0.5);
        assert!(
            digest.centroids.len() < 400,
            "centroid count {} is unbounded",
            digest.centroids.len()
        );
    }

    #[test]
    fn test_merge_matches_combined_stream() {
        let mut left = TDigest::default();
        let mut right = TDigest::default();
        let mut combined = TDigest::default();
        for i in 0..5_000 {
            left.add(i as f64);
            combined.add(i as f64);
        }
        for i in 5_000..10_000 {
            right.add(i as f64);
            combined.add(i as f64);
        }
        left.merge(&right);
        assert_eq!(left.count(), 10_000);
        let merged_p99 = left.quantile(0.99).unwrap();
        let combined_p99 = combined.quantile(0.99).unwrap();
        assert!(
            (merged_p99 - combined_p99).abs() / 10_000.0 < 0.02,
            "merge drifted: {merged_p99} vs {combined_p99}"
        );
    }

    #[test]
    fn test_skewed_distribution_tail() {
        // 99% fast requests, 1% slow: the p99 must land in the slow band.
        let mut digest = TDigest::default();
        for i in 0..9_900 {
            digest.add(10.0 + (i % 10) as f64);
        }
        for _ in 0..100 {
            digest.add(500.0);
        }
        let p999 = digest.quantile(0.999).unwrap();
        assert!(p999 > 300.0, "p99.9 {p999} missed the slow tail");
        let p50 = digest.quantile(0.5).unwrap();
        assert!(p50 < 25.0, "p50 {p50} dragged up by the tail");
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let mut digest = TDigest::default();
        digest.add(f64::NAN);
        digest.add(f64::INFINITY);
        digest.add(1.0);
        assert_eq!(digest.count(), 1);
    }

    proptest::proptest! {
        /// Quantiles are monotone in q and stay inside [min, max].
        #[test]
        fn prop_quantiles_monotone_and_bounded(
            values in proptest::collection::vec(0.0f64..10_000.0, 10..500),
        ) {
            let mut digest = TDigest::default();
            for value in &values {
                digest.add(*value);
            }
            let q50 = digest.quantile(0.5).unwrap();
            let q90 = digest.quantile(0.9).unwrap();
            let q99 = digest.quantile(0.99).unwrap();
            proptest::prop_assert!(q50 <= q90 + 1e-9);
            proptest::prop_assert!(q90 <= q99 + 1e-9);
            let min = digest.min().unwrap();
            let max = digest.max().unwrap();
            proptest::prop_assert!(q50 >= min - 1e-9);
            proptest::prop_assert!(q99 <= max + 1e-9);
        }
    }
}
