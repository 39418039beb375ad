// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! QoS control plane.
//!
//! Three collaborators behind one facade: the [`policy::PolicyStore`]
//! versions SLO policies, the [`evaluator::Evaluator`] checks percentile
//! objectives over sliding windows on every ingested sample, and the
//! [`executor::Executor`] serialises remediation actions through a handler
//! registry. The [`QosMonitor`] wires them to the batcher and registry and
//! turns stream outcomes into metric samples.

pub mod evaluator;
pub mod executor;
pub mod policy;
pub mod tdigest;
pub mod window;

pub use evaluator::{Evaluator, MetricSample, Violation};
pub use executor::{Executor, RemediationHandler};
pub use policy::{Policy, PolicyChange, PolicyStore, RemediationAction, Severity, Slo};
pub use tdigest::TDigest;
pub use window::{WindowedCounts, WindowedDigest};

use crate::batcher::BatcherControl;
use crate::config::QosConfig;
use crate::events::OperatorBus;
use crate::registry::{StreamOutcome, StreamPhase, StreamRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Capacity of the evaluator → executor violation channel.
const VIOLATION_CHANNEL_DEPTH: usize = 64;

/// Facade over the QoS collaborators.
pub struct QosMonitor {
    config: QosConfig,
    store: Arc<PolicyStore>,
    evaluator: Option<Evaluator>,
    executor: Option<Executor>,
}

impl QosMonitor {
    /// Wire the control plane to its remediation targets.
    ///
    /// `extra_handlers` extends (and may override) the built-in handler
    /// registry.
    #[must_use]
    pub fn new(
        config: QosConfig,
        control: Arc<BatcherControl>,
        registry: Arc<StreamRegistry>,
        bus: OperatorBus,
        extra_handlers: HashMap<String, Arc<dyn RemediationHandler>>,
    ) -> Self {
        let store = Arc::new(PolicyStore::new());
        let (violations_tx, violations_rx) = mpsc::channel(VIOLATION_CHANNEL_DEPTH);

        let evaluator = (config.enabled && config.evaluator_enabled)
            .then(|| Evaluator::new(Arc::clone(&store), violations_tx));

        let executor = (config.enabled && config.executor_enabled).then(|| {
            let mut handlers = Executor::builtin_handlers(control, registry, bus.clone());
            handlers.extend(extra_handlers);
            Executor::spawn(violations_rx, handlers, config.dry_run, bus)
        });

        Self {
            config,
            store,
            evaluator,
            executor,
        }
    }

    /// The policy store, for runtime edits.
    #[must_use]
    pub fn store(&self) -> Arc<PolicyStore> {
        Arc::clone(&self.store)
    }

    /// Load the startup policy set.
    pub fn load_policies(&self, policies: Vec<Policy>) {
        if !self.config.store_enabled {
            warn!("policy store disabled, ignoring {} policies", policies.len());
            return;
        }
        self.store.load(policies);
    }

    /// Ingest one metric sample.
    pub fn observe(&self, sample: &MetricSample) {
        if let Some(evaluator) = &self.evaluator {
            evaluator.on_sample(sample);
        }
    }

    /// Turn one stream outcome into metric samples and ingest them.
    pub fn observe_outcome(&self, outcome: &StreamOutcome, version: &str) {
        if self.evaluator.is_none() {
            return;
        }
        if let Some(ttft_ms) = outcome.ttft_ms {
            self.observe(
                &MetricSample::new("ttft_ms", ttft_ms)
                    .with_label("model", outcome.model_id.clone())
                    .with_label("version", version),
            );
        }
        if outcome.phase == StreamPhase::Completed {
            self.observe(
                &MetricSample::new("tokens_per_second", outcome.tokens_per_second)
                    .with_label("model", outcome.model_id.clone())
                    .with_label("version", version),
            );
            self.observe(
                &MetricSample::new("total_time_ms", outcome.total_time_ms)
                    .with_label("model", outcome.model_id.clone())
                    .with_label("version", version),
            );
        }
    }

    /// Stop the executor worker.
    pub fn shutdown(&self) {
        if let Some(executor) = &self.executor {
            executor.shutdown();
        }
    }
}

impl std::fmt::Debug for QosMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosMonitor")
            .field("enabled", &self.config.enabled)
            .field("dry_run", &self.config.dry_run)
            .field("evaluator", &self.evaluator.is_some())
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatchDispatcher, GenerateBatcher};
    use crate::config::{BatcherConfig, RegistryConfig};
    use crate::errors::{EngineError, Result};
    use crate::events::operator_bus;
    use async_trait::async_trait;
    use std::time::Duration;
    use weft_protocol::{GenerateAck, GenerateParams};

    struct NullDispatcher;

    #[async_trait]
    impl BatchDispatcher for NullDispatcher {
        async fn dispatch(
            &self,
            requests: Vec<GenerateParams>,
        ) -> Result<Vec<std::result::Result<GenerateAck, EngineError>>> {
            Ok(requests
                .into_iter()
                .map(|r| {
                    Ok(GenerateAck {
                        stream_id: r.stream_id,
                        started_at: 0,
                    })
                })
                .collect())
        }
    }

    fn monitor(config: QosConfig) -> (QosMonitor, Arc<BatcherControl>) {
        let registry = StreamRegistry::new(RegistryConfig::default());
        let batcher = GenerateBatcher::new(
            BatcherConfig::default(),
            Arc::new(NullDispatcher),
            Arc::clone(&registry),
        );
        let control = batcher.control();
        let monitor = QosMonitor::new(
            config,
            Arc::clone(&control),
            registry,
            operator_bus(),
            HashMap::new(),
        );
        (monitor, control)
    }

    fn scale_down_policy() -> Policy {
        Policy {
            id: "latency".into(),
            priority: 0,
            enabled: true,
            slos: vec![Slo {
                metric: "ttft_ms".into(),
                percentile: 0.99,
                threshold: 100.0,
                window_ms: 50,
                severity: Severity::Critical,
                tenant_id: None,
            }],
            actions: vec![RemediationAction {
                action_type: "scale_down".into(),
                target: "batcher".into(),
                params: serde_json::json!({"delta": 4}),
                reason: "latency".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_end_to_end_violation_triggers_remediation() {
        let (monitor, control) = monitor(QosConfig::default());
        monitor.load_policies(vec![scale_down_policy()]);
        let initial = control.max_batch_size();

        for _ in 0..10 {
            monitor.observe(&MetricSample::new("ttft_ms", 900.0));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(control.max_batch_size(), initial - 4);
    }

    #[tokio::test]
    async fn test_disabled_monitor_is_inert() {
        let (monitor, control) = monitor(QosConfig {
            enabled: false,
            ..QosConfig::default()
        });
        monitor.load_policies(vec![scale_down_policy()]);
        let initial = control.max_batch_size();
        for _ in 0..10 {
            monitor.observe(&MetricSample::new("ttft_ms", 900.0));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(control.max_batch_size(), initial);
    }

    #[tokio::test]
    async fn test_outcome_produces_latency_samples() {
        let (monitor, control) = monitor(QosConfig::default());
        monitor.load_policies(vec![scale_down_policy()]);
        let initial = control.max_batch_size();

        for _ in 0..10 {
            monitor.observe_outcome(
                &StreamOutcome {
                    stream_id: "s".into(),
                    model_id: "m".into(),
                    lane: "baseline",
                    phase: StreamPhase::Completed,
                    ttft_ms: Some(900.0),
                    tokens: 10,
                    total_time_ms: 1_000.0,
                    tokens_per_second: 10.0,
                },
                "baseline",
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(control.max_batch_size(), initial - 4);
    }
}
