// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Canary router and rollback controller.
//!
//! Routing is deterministic and sticky: a routing key hashes (with a
//! configurable seed) into one of 100 buckets, and keys below the rollout
//! percentage go to the variant runtime. The rollback controller compares
//! error rate and tail latency between the lanes every evaluation window
//! and slams the rollout back to 0% when the variant regresses, freezing
//! rollouts for a cooldown period.

use crate::config::CanaryConfig;
use crate::errors::{EngineError, Result};
use crate::events::{OperatorBus, OperatorEvent};
use crate::metrics;
use crate::metrics_constants::{METRIC_CANARY_ROLLBACKS_TOTAL, METRIC_CANARY_ROUTED_TOTAL};
use crate::qos::window::{WindowedCounts, WindowedDigest};
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, Opts};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

static CANARY_ROUTED: LazyLock<CounterVec> = LazyLock::new(|| {
    metrics::counter_vec(
        Opts::new(METRIC_CANARY_ROUTED_TOTAL, "Total requests routed, by version"),
        &["version"],
    )
});
static CANARY_ROLLBACKS: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(METRIC_CANARY_ROLLBACKS_TOTAL, "Total automatic rollbacks")
});

/// Which runtime lane serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeVersion {
    /// The steady-state lane.
    Baseline,
    /// The canary lane.
    Variant,
}

impl RuntimeVersion {
    /// Label used in metrics and QoS samples.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeVersion::Baseline => "baseline",
            RuntimeVersion::Variant => "variant",
        }
    }
}

// ============================================================================
// Comparative metrics
// ============================================================================

struct VersionWindow {
    counts: WindowedCounts,
    latency: WindowedDigest,
}

impl VersionWindow {
    fn new(window: Duration) -> Self {
        Self {
            counts: WindowedCounts::new(window),
            latency: WindowedDigest::new(window, crate::qos::tdigest::DEFAULT_COMPRESSION),
        }
    }
}

/// Comparative snapshot of both lanes.
#[derive(Debug, Clone)]
pub struct ComparativeSnapshot {
    /// Baseline error rate over the window.
    pub baseline_error_rate: f64,
    /// Variant error rate over the window.
    pub variant_error_rate: f64,
    /// Baseline p99 latency in milliseconds, when sampled.
    pub baseline_p99_ms: Option<f64>,
    /// Variant p99 latency in milliseconds, when sampled.
    pub variant_p99_ms: Option<f64>,
    /// Baseline observations in the window.
    pub baseline_samples: u64,
    /// Variant observations in the window.
    pub variant_samples: u64,
}

/// Per-version sliding windows of error rate and latency.
pub struct MetricsAggregator {
    baseline: Mutex<VersionWindow>,
    variant: Mutex<VersionWindow>,
}

impl MetricsAggregator {
    fn new(window: Duration) -> Self {
        Self {
            baseline: Mutex::new(VersionWindow::new(window)),
            variant: Mutex::new(VersionWindow::new(window)),
        }
    }

    /// Record one completed or failed request.
    pub fn record(&self, version: RuntimeVersion, latency_ms: Option<f64>, is_error: bool) {
        let lane = match version {
            RuntimeVersion::Baseline => &self.baseline,
            RuntimeVersion::Variant => &self.variant,
        };
        let mut lane = lane.lock();
        lane.counts.record(is_error);
        if let Some(latency_ms) = latency_ms {
            lane.latency.record(latency_ms);
        }
    }

    /// Snapshot both lanes.
    #[must_use]
    pub fn snapshot(&self) -> ComparativeSnapshot {
        let mut baseline = self.baseline.lock();
        let mut variant = self.variant.lock();
        let (baseline_total, _) = baseline.counts.totals();
        let (variant_total, _) = variant.counts.totals();
        ComparativeSnapshot {
            baseline_error_rate: baseline.counts.error_rate(),
            variant_error_rate: variant.counts.error_rate(),
            baseline_p99_ms: baseline.latency.quantile(0.99),
            variant_p99_ms: variant.latency.quantile(0.99),
            baseline_samples: baseline_total,
            variant_samples: variant_total,
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Deterministic hash-split router with automated rollback.
pub struct CanaryRouter {
    config: CanaryConfig,
    percentage: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
    aggregator: Arc<MetricsAggregator>,
    bus: OperatorBus,
    controller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CanaryRouter {
    /// Build a router and start its rollback controller when canarying is
    /// enabled.
    #[must_use]
    pub fn new(config: CanaryConfig, bus: OperatorBus) -> Arc<Self> {
        let window = Duration::from_millis(config.evaluation_window_ms.max(1));
        let router = Arc::new(Self {
            percentage: AtomicU32::new(u32::from(config.rollout_percentage)),
            aggregator: Arc::new(MetricsAggregator::new(window)),
            cooldown_until: Mutex::new(None),
            bus,
            controller: Mutex::new(None),
            config,
        });
        if router.config.enabled {
            let handle = tokio::spawn(Self::rollback_loop(Arc::clone(&router)));
            *router.controller.lock() = Some(handle);
        }
        router
    }

    /// Current rollout percentage.
    #[must_use]
    pub fn percentage(&self) -> u8 {
        self.percentage.load(Ordering::Acquire) as u8
    }

    /// Whether rollouts are frozen.
    #[must_use]
    pub fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    /// Pick a lane for a routing key. Deterministic for a fixed
    /// `(key, seed, percentage)`.
    #[must_use]
    pub fn route(&self, key: &str) -> RuntimeVersion {
        let version = if self.config.enabled && self.should_route_variant(key) {
            RuntimeVersion::Variant
        } else {
            RuntimeVersion::Baseline
        };
        CANARY_ROUTED.with_label_values(&[version.as_str()]).inc();
        version
    }

    /// The routing predicate: first 32 bits of `sha256(key || seed)`
    /// modulo 100, variant iff below the percentage.
    #[must_use]
    pub fn should_route_variant(&self, key: &str) -> bool {
        let percentage = self.percentage.load(Ordering::Acquire);
        if percentage == 0 {
            return false;
        }
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(self.config.hash_seed.as_bytes());
        let digest = hasher.finalize();
        let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100;
        bucket < percentage
    }

    /// Adjust the rollout percentage. Progressive rollout is driven
    /// externally through this.
    ///
    /// # Errors
    ///
    /// `Validation` above 100; `CircuitOpen` while rollouts are frozen by a
    /// rollback cooldown.
    pub fn set_percentage(&self, percentage: u8) -> Result<()> {
        if percentage > 100 {
            return Err(EngineError::Validation(
                "rollout percentage must lie within [0, 100]".into(),
            ));
        }
        if self.in_cooldown() {
            return Err(EngineError::CircuitOpen(
                "rollouts are frozen by the rollback cooldown".into(),
            ));
        }
        self.percentage
            .store(u32::from(percentage), Ordering::Release);
        info!(percentage, "canary rollout percentage set");
        Ok(())
    }

    /// Comparative metrics sink for completed requests.
    #[must_use]
    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Stop the rollback controller.
    pub fn shutdown(&self) {
        if let Some(handle) = self.controller.lock().take() {
            handle.abort();
        }
    }

    fn rollback(&self, reason: String, snapshot: &ComparativeSnapshot) {
        self.percentage.store(0, Ordering::Release);
        *self.cooldown_until.lock() =
            Some(Instant::now() + Duration::from_millis(self.config.cooldown_ms));
        CANARY_ROLLBACKS.inc();
        warn!(
            reason = %reason,
            variant_error_rate = snapshot.variant_error_rate,
            baseline_error_rate = snapshot.baseline_error_rate,
            "canary rolled back"
        );
        let _ = self.bus.send(OperatorEvent::CanaryRollback {
            reason,
            variant_error_rate: snapshot.variant_error_rate,
            baseline_error_rate: snapshot.baseline_error_rate,
            variant_p99_ms: snapshot.variant_p99_ms.unwrap_or(0.0),
        });
    }

    async fn rollback_loop(router: Arc<Self>) {
        let every = Duration::from_millis(router.config.evaluation_window_ms.max(10));
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if router.percentage() == 0 {
                continue;
            }
            let snapshot = router.aggregator.snapshot();
            if snapshot.variant_samples < router.config.min_samples {
                continue;
            }

            let error_delta = snapshot.variant_error_rate - snapshot.baseline_error_rate;
            if error_delta > router.config.error_rate_delta {
                router.rollback(
                    format!(
                        "variant error rate exceeds baseline by {error_delta:.3} (limit {:.3})",
                        router.config.error_rate_delta
                    ),
                    &snapshot,
                );
                continue;
            }
            if let Some(variant_p99) = snapshot.variant_p99_ms {
                if variant_p99 > router.config.p99_latency_threshold_ms {
                    router.rollback(
                        format!(
                            "variant p99 {variant_p99:.0}ms exceeds {:.0}ms",
                            router.config.p99_latency_threshold_ms
                        ),
                        &snapshot,
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for CanaryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanaryRouter")
            .field("enabled", &self.config.enabled)
            .field("percentage", &self.percentage())
            .field("in_cooldown", &self.in_cooldown())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::operator_bus;

    fn canary_config() -> CanaryConfig {
        CanaryConfig {
            enabled: true,
            rollout_percentage: 10,
            hash_seed: "s".into(),
            error_rate_delta: 0.05,
            p99_latency_threshold_ms: 200.0,
            evaluation_window_ms: 50,
            cooldown_ms: 300,
            min_samples: 20,
        }
    }

    #[tokio::test]
    async fn test_routing_is_deterministic_and_roughly_proportional() {
        let router = CanaryRouter::new(canary_config(), operator_bus());
        let keys: Vec<String> = (1..=1_000).map(|i| format!("user-{i}")).collect();

        let first: Vec<bool> = keys.iter().map(|k| router.should_route_variant(k)).collect();
        let second: Vec<bool> = keys.iter().map(|k| router.should_route_variant(k)).collect();
        assert_eq!(first, second, "routing must be bit-identical across runs");

        let variants = first.iter().filter(|&&v| v).count();
        assert!(
            (80..=120).contains(&variants),
            "~10% of 1000 keys expected in the variant, got {variants}"
        );
    }

    #[tokio::test]
    async fn test_disabled_router_always_baseline() {
        let config = CanaryConfig {
            enabled: false,
            rollout_percentage: 50,
            ..canary_config()
        };
        let router = CanaryRouter::new(config, operator_bus());
        for i in 0..100 {
            assert_eq!(router.route(&format!("k{i}")), RuntimeVersion::Baseline);
        }
    }

    #[tokio::test]
    async fn test_seed_change_reshuffles() {
        let mut config_a = canary_config();
        config_a.rollout_percentage = 50;
        let mut config_b = config_a.clone();
        config_b.hash_seed = "other".into();

        let router_a = CanaryRouter::new(config_a, operator_bus());
        let router_b = CanaryRouter::new(config_b, operator_bus());
        let keys: Vec<String> = (0..500).map(|i| format!("user-{i}")).collect();
        let a: Vec<bool> = keys.iter().map(|k| router_a.should_route_variant(k)).collect();
        let b: Vec<bool> = keys.iter().map(|k| router_b.should_route_variant(k)).collect();
        assert_ne!(a, b, "different seeds must shuffle differently");
    }

    #[tokio::test]
    async fn test_set_percentage_validation() {
        let router = CanaryRouter::new(canary_config(), operator_bus());
        assert!(matches!(
            router.set_percentage(101),
            Err(EngineError::Validation(_))
        ));
        router.set_percentage(25).unwrap();
        assert_eq!(router.percentage(), 25);
    }

    #[tokio::test]
    async fn test_latency_regression_triggers_rollback_and_cooldown() {
        let router = CanaryRouter::new(canary_config(), operator_bus());
        let mut events = router.bus.subscribe();
        let aggregator = router.aggregator();

        // Two evaluation windows of regressed variant traffic.
        for _ in 0..2 {
            for _ in 0..30 {
                aggregator.record(RuntimeVersion::Baseline, Some(100.0), false);
                aggregator.record(RuntimeVersion::Variant, Some(300.0), false);
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
        }

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            OperatorEvent::CanaryRollback { variant_p99_ms, .. } => {
                assert!(variant_p99_ms > 200.0);
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(router.percentage(), 0);

        // Rollouts frozen during cooldown...
        let err = router.set_percentage(10).unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen(_)));
        assert!(router.in_cooldown());

        // ...and allowed again once it lapses.
        tokio::time::sleep(Duration::from_millis(350)).await;
        router.set_percentage(10).unwrap();
        assert_eq!(router.percentage(), 10);
    }

    #[tokio::test]
    async fn test_error_rate_delta_triggers_rollback() {
        let mut config = canary_config();
        config.p99_latency_threshold_ms = 100_000.0; // only the error path can trip
        let router = CanaryRouter::new(config, operator_bus());
        let aggregator = router.aggregator();

        for _ in 0..40 {
            aggregator.record(RuntimeVersion::Baseline, Some(50.0), false);
            // 25% variant errors against a clean baseline.
            aggregator.record(RuntimeVersion::Variant, Some(50.0), false);
        }
        for _ in 0..10 {
            aggregator.record(RuntimeVersion::Variant, None, true);
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if router.percentage() == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_samples_never_roll_back() {
        let router = CanaryRouter::new(canary_config(), operator_bus());
        let aggregator = router.aggregator();
        // Far fewer than min_samples, but horrendous latency.
        for _ in 0..5 {
            aggregator.record(RuntimeVersion::Variant, Some(10_000.0), true);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(router.percentage(), 10, "sparse data must not trip rollback");
    }
}
