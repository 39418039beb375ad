// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Small numeric helpers used by metrics and window bookkeeping.

/// Index of the `q`-quantile element in a sorted slice of length `len`.
///
/// `q` is clamped to `[0, 1]`; the result is always a valid index for a
/// non-empty slice. Returns 0 for empty input by convention.
#[must_use]
pub fn percentile_index(len: usize, q: f64) -> usize {
    if len == 0 {
        return 0;
    }
    let q = q.clamp(0.0, 1.0);
    ((len as f64 * q) as usize).min(len - 1)
}

/// `numerator / denominator`, 0.0 when the denominator is zero.
#[must_use]
pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Exponentially weighted moving average step.
///
/// `alpha` is the weight of the new sample, clamped to `[0, 1]`.
#[must_use]
pub fn ewma(previous: f64, sample: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    previous + alpha * (sample - previous)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_index_bounds() {
        assert_eq!(percentile_index(0, 0.99), 0);
        assert_eq!(percentile_index(1, 0.99), 0);
        assert_eq!(percentile_index(100, 0.0), 0);
        assert_eq!(percentile_index(100, 0.5), 50);
        assert_eq!(percentile_index(100, 1.0), 99);
        assert_eq!(percentile_index(100, 7.5), 99);
    }

    #[test]
    fn test_ratio_zero_denominator() {
        assert_eq!(ratio(5, 0), 0.0);
        assert_eq!(ratio(1, 2), 0.5);
    }

    #[test]
    fn test_ewma_converges() {
        let mut value = 0.0;
        for _ in 0..200 {
            value = ewma(value, 100.0, 0.1);
        }
        assert!((value - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_ewma_alpha_clamped() {
        assert_eq!(ewma(10.0, 20.0, 5.0), 20.0);
        assert_eq!(ewma(10.0, 20.0, -1.0), 10.0);
    }
}
