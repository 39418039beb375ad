// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! SLO evaluator.
//!
//! Samples stream in, land in per-`(metric, labels, window)` digests, and
//! are checked against matching policies at window granularity. A breach
//! emits one violation; re-emission is suppressed while the violation is
//! active, and clearing takes two consecutive clean windows (hysteresis),
//! so a metric oscillating around its threshold cannot flap remediations.

use crate::qos::policy::{PolicyStore, Slo};
use crate::qos::window::WindowedDigest;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Clean windows required before an active violation clears.
const CLEAR_AFTER_CLEAN_WINDOWS: u32 = 2;

/// Samples required in a window before it is judged at all.
const MIN_SAMPLES_PER_EVALUATION: u64 = 5;

/// One metric observation.
#[derive(Debug, Clone)]
pub struct MetricSample {
    /// Metric name.
    pub metric: String,
    /// Observed value.
    pub value: f64,
    /// Free-form labels; `tenant` scopes policy matching.
    pub labels: BTreeMap<String, String>,
}

impl MetricSample {
    /// A sample with no labels.
    #[must_use]
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            labels: BTreeMap::new(),
        }
    }

    /// Attach a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn tenant(&self) -> Option<&str> {
        self.labels.get("tenant").map(String::as_str)
    }

    fn labels_key(&self) -> String {
        // BTreeMap iteration is sorted, so the key is canonical.
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// An emitted SLO violation, consumed by the executor.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Violated policy.
    pub policy_id: String,
    /// The breached objective.
    pub slo: Slo,
    /// Observed percentile value.
    pub observed: f64,
    /// Tenant scope of the sample that triggered evaluation.
    pub tenant: Option<String>,
    /// Remediations from the policy, in order.
    pub actions: Vec<crate::qos::policy::RemediationAction>,
}

struct ViolationState {
    active: bool,
    clean_windows: u32,
    last_evaluated: Instant,
}

struct MatchCache {
    version: u64,
    table: HashMap<(String, Option<String>), Vec<Arc<crate::qos::policy::Policy>>>,
}

/// Evaluates samples against the policy store.
pub struct Evaluator {
    store: Arc<PolicyStore>,
    windows: Mutex<HashMap<String, WindowedDigest>>,
    states: Mutex<HashMap<String, ViolationState>>,
    match_cache: Mutex<MatchCache>,
    violations: mpsc::Sender<Violation>,
}

impl Evaluator {
    /// Build an evaluator emitting violations into `violations`.
    #[must_use]
    pub fn new(store: Arc<PolicyStore>, violations: mpsc::Sender<Violation>) -> Self {
        Self {
            store,
            windows: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            match_cache: Mutex::new(MatchCache {
                version: 0,
                table: HashMap::new(),
            }),
            violations,
        }
    }

    /// Ingest one sample: update windows, evaluate due SLOs, emit
    /// violations.
    pub fn on_sample(&self, sample: &MetricSample) {
        let policies = self.matching_cached(&sample.metric, sample.tenant());
        if policies.is_empty() {
            return;
        }
        let labels_key = sample.labels_key();

        for policy in policies {
            for (slo_index, slo) in policy.slos.iter().enumerate() {
                if slo.metric != sample.metric {
                    continue;
                }
                if let Some(scope) = &slo.tenant_id {
                    if sample.tenant() != Some(scope.as_str()) {
                        continue;
                    }
                }

                let window_key = format!("{}|{}|{}", sample.metric, labels_key, slo.window_ms);
                let observed = {
                    let mut windows = self.windows.lock();
                    let window = windows.entry(window_key).or_insert_with(|| {
                        WindowedDigest::new(
                            Duration::from_millis(slo.window_ms.max(1)),
                            crate::qos::tdigest::DEFAULT_COMPRESSION,
                        )
                    });
                    window.record(sample.value);
                    if window.count() < MIN_SAMPLES_PER_EVALUATION {
                        continue;
                    }
                    match window.quantile(slo.percentile) {
                        Some(observed) => observed,
                        None => continue,
                    }
                };

                self.judge(&policy, slo_index, slo, &labels_key, observed, sample.tenant());
            }
        }
    }

    /// Evaluate one SLO state at window granularity.
    fn judge(
        &self,
        policy: &Arc<crate::qos::policy::Policy>,
        slo_index: usize,
        slo: &Slo,
        labels_key: &str,
        observed: f64,
        tenant: Option<&str>,
    ) {
        let state_key = format!("{}#{slo_index}|{labels_key}", policy.id);
        let window = Duration::from_millis(slo.window_ms.max(1));
        let now = Instant::now();
        let breached = observed > slo.threshold;

        let emit = {
            let mut states = self.states.lock();
            let state = states.entry(state_key).or_insert_with(|| ViolationState {
                active: false,
                clean_windows: 0,
                // Backdate so the first judgement happens immediately.
                last_evaluated: now - window,
            });

            // One judgement per window; mid-window samples only feed the
            // digest.
            if now.duration_since(state.last_evaluated) < window {
                return;
            }
            state.last_evaluated = now;

            match (breached, state.active) {
                (true, false) => {
                    state.active = true;
                    state.clean_windows = 0;
                    true
                }
                (true, true) => {
                    // Still violating: suppress re-emission.
                    state.clean_windows = 0;
                    false
                }
                (false, true) => {
                    state.clean_windows += 1;
                    if state.clean_windows >= CLEAR_AFTER_CLEAN_WINDOWS {
                        debug!(policy_id = %policy.id, "violation cleared after clean windows");
                        state.active = false;
                        state.clean_windows = 0;
                    }
                    false
                }
                (false, false) => false,
            }
        };

        if emit {
            let violation = Violation {
                policy_id: policy.id.clone(),
                slo: slo.clone(),
                observed,
                tenant: tenant.map(String::from),
                actions: policy.actions.clone(),
            };
            // A saturated executor drops the oldest work implicitly; the
            // violation will re-emerge next window if it persists.
            let _ = self.violations.try_send(violation);
        }
    }

    fn matching_cached(
        &self,
        metric: &str,
        tenant: Option<&str>,
    ) -> Vec<Arc<crate::qos::policy::Policy>> {
        let version = self.store.version();
        let mut cache = self.match_cache.lock();
        if cache.version != version {
            cache.table.clear();
            cache.version = version;
        }
        let key = (metric.to_string(), tenant.map(String::from));
        if let Some(hit) = cache.table.get(&key) {
            return hit.clone();
        }
        let matched = self.store.matching(metric, tenant);
        cache.table.insert(key, matched.clone());
        matched
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("windows", &self.windows.lock().len())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::policy::{Policy, RemediationAction, Severity};

    fn latency_policy(threshold: f64, window_ms: u64) -> Policy {
        Policy {
            id: "latency-guard".into(),
            priority: 0,
            enabled: true,
            slos: vec![Slo {
                metric: "ttft_ms".into(),
                percentile: 0.99,
                threshold,
                window_ms,
                severity: Severity::Critical,
                tenant_id: None,
            }],
            actions: vec![RemediationAction {
                action_type: "scale_down".into(),
                target: "batcher".into(),
                params: serde_json::Value::Null,
                reason: "protect latency".into(),
            }],
        }
    }

    fn build(threshold: f64, window_ms: u64) -> (Evaluator, mpsc::Receiver<Violation>) {
        let store = Arc::new(PolicyStore::new());
        store.load(vec![latency_policy(threshold, window_ms)]);
        let (tx, rx) = mpsc::channel(16);
        (Evaluator::new(store, tx), rx)
    }

    #[tokio::test]
    async fn test_breach_emits_one_violation() {
        let (evaluator, mut rx) = build(100.0, 50);
        for _ in 0..10 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 500.0));
        }
        let violation = rx.try_recv().unwrap();
        assert_eq!(violation.policy_id, "latency-guard");
        assert!(violation.observed > 100.0);
        assert_eq!(violation.actions.len(), 1);
        // Still breaching inside the same window: no re-emission.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_healthy_metric_emits_nothing() {
        let (evaluator, mut rx) = build(1_000.0, 50);
        for _ in 0..50 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 20.0));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_too_few_samples_not_judged() {
        let (evaluator, mut rx) = build(100.0, 50);
        for _ in 0..3 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 9_999.0));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hysteresis_requires_two_clean_windows() {
        let window_ms = 100u64;
        let (evaluator, mut rx) = build(100.0, window_ms);

        // Breach and emit.
        for _ in 0..10 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 500.0));
        }
        assert!(rx.try_recv().is_ok());

        // One clean window is not enough to clear: a renewed breach right
        // after must NOT re-emit.
        tokio::time::advance(Duration::from_millis(window_ms + 10)).await;
        for _ in 0..20 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 10.0));
        }
        tokio::time::advance(Duration::from_millis(window_ms + 10)).await;
        for _ in 0..30 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 500.0));
        }
        assert!(
            rx.try_recv().is_err(),
            "violation never cleared, re-emission must be suppressed"
        );

        // Two consecutive clean windows clear it; the next breach emits
        // again.
        tokio::time::advance(Duration::from_millis(2 * (window_ms + 400))).await;
        for _ in 0..200 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 10.0));
        }
        tokio::time::advance(Duration::from_millis(window_ms + 10)).await;
        for _ in 0..200 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 10.0));
        }
        tokio::time::advance(Duration::from_millis(window_ms + 10)).await;
        for _ in 0..300 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 800.0));
        }
        assert!(rx.try_recv().is_ok(), "cleared violation must re-emit");
    }

    #[tokio::test]
    async fn test_match_cache_invalidated_by_store_edit() {
        let store = Arc::new(PolicyStore::new());
        let (tx, mut rx) = mpsc::channel(16);
        let evaluator = Evaluator::new(Arc::clone(&store), tx);

        // No policies yet: samples are ignored.
        for _ in 0..10 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 500.0));
        }
        assert!(rx.try_recv().is_err());

        // Adding a policy at runtime must take effect without a restart.
        store.upsert(latency_policy(100.0, 50));
        for _ in 0..10 {
            evaluator.on_sample(&MetricSample::new("ttft_ms", 500.0));
        }
        assert!(rx.try_recv().is_ok());
    }
}
