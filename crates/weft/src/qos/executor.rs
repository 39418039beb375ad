// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Remediation executor.
//!
//! One worker consumes violations and dispatches their remediation actions
//! through a handler registry, serially, so concurrent policies cannot race
//! on the same target. Handler errors are reported on the operator bus and
//! never abort evaluation. Dry-run mode logs what would have happened.

use crate::batcher::BatcherControl;
use crate::errors::Result;
use crate::events::{OperatorBus, OperatorEvent};
use crate::metrics;
use crate::metrics_constants::{METRIC_REMEDIATIONS_TOTAL, METRIC_SLO_VIOLATIONS_TOTAL};
use crate::qos::evaluator::Violation;
use crate::qos::policy::RemediationAction;
use crate::registry::StreamRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, Opts};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

static REMEDIATIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    metrics::counter_vec(
        Opts::new(METRIC_REMEDIATIONS_TOTAL, "Total remediation actions applied"),
        &["action", "outcome"],
    )
});
static SLO_VIOLATIONS: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(METRIC_SLO_VIOLATIONS_TOTAL, "Total SLO violations emitted")
});

/// A remediation implementation.
#[async_trait]
pub trait RemediationHandler: Send + Sync {
    /// Apply one action for one violation.
    async fn apply(&self, action: &RemediationAction, violation: &Violation) -> Result<()>;
}

// ============================================================================
// Built-in handlers
// ============================================================================

/// `scale_up`: raise the batcher's batch ceiling.
pub struct ScaleUpHandler {
    control: Arc<BatcherControl>,
}

#[async_trait]
impl RemediationHandler for ScaleUpHandler {
    async fn apply(&self, action: &RemediationAction, _violation: &Violation) -> Result<()> {
        let delta = action.params.get("delta").and_then(|v| v.as_u64()).unwrap_or(2) as usize;
        let current = self.control.max_batch_size();
        self.control.set_max_batch_size(current + delta);
        info!(from = current, to = self.control.max_batch_size(), "scaled batch ceiling up");
        Ok(())
    }
}

/// `scale_down`: lower the batcher's batch ceiling.
pub struct ScaleDownHandler {
    control: Arc<BatcherControl>,
}

#[async_trait]
impl RemediationHandler for ScaleDownHandler {
    async fn apply(&self, action: &RemediationAction, _violation: &Violation) -> Result<()> {
        let delta = action.params.get("delta").and_then(|v| v.as_u64()).unwrap_or(2) as usize;
        let current = self.control.max_batch_size();
        self.control
            .set_max_batch_size(current.saturating_sub(delta));
        info!(from = current, to = self.control.max_batch_size(), "scaled batch ceiling down");
        Ok(())
    }
}

/// `reject`: engage or release the registry's admission guard.
pub struct RejectHandler {
    registry: Arc<StreamRegistry>,
}

#[async_trait]
impl RemediationHandler for RejectHandler {
    async fn apply(&self, action: &RemediationAction, _violation: &Violation) -> Result<()> {
        let engage = action
            .params
            .get("enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        self.registry.set_admission_open(!engage);
        info!(engage, "admission guard toggled by remediation");
        Ok(())
    }
}

/// `alert`: push a structured event onto the operator bus.
pub struct AlertHandler {
    bus: OperatorBus,
}

#[async_trait]
impl RemediationHandler for AlertHandler {
    async fn apply(&self, action: &RemediationAction, violation: &Violation) -> Result<()> {
        let _ = self.bus.send(OperatorEvent::Alert {
            policy_id: violation.policy_id.clone(),
            target: action.target.clone(),
            reason: action.reason.clone(),
            severity: violation.slo.severity,
        });
        Ok(())
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Serialised remediation dispatcher.
pub struct Executor {
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Executor {
    /// Registry of built-in handlers wired to their targets.
    #[must_use]
    pub fn builtin_handlers(
        control: Arc<BatcherControl>,
        registry: Arc<StreamRegistry>,
        bus: OperatorBus,
    ) -> HashMap<String, Arc<dyn RemediationHandler>> {
        let mut handlers: HashMap<String, Arc<dyn RemediationHandler>> = HashMap::new();
        handlers.insert(
            "scale_up".into(),
            Arc::new(ScaleUpHandler {
                control: Arc::clone(&control),
            }),
        );
        handlers.insert(
            "scale_down".into(),
            Arc::new(ScaleDownHandler { control }),
        );
        handlers.insert("reject".into(), Arc::new(RejectHandler { registry }));
        handlers.insert("alert".into(), Arc::new(AlertHandler { bus }));
        handlers
    }

    /// Start the worker over a violation stream.
    #[must_use]
    pub fn spawn(
        mut violations: mpsc::Receiver<Violation>,
        handlers: HashMap<String, Arc<dyn RemediationHandler>>,
        dry_run: bool,
        bus: OperatorBus,
    ) -> Self {
        let worker = tokio::spawn(async move {
            while let Some(violation) = violations.recv().await {
                SLO_VIOLATIONS.inc();
                let _ = bus.send(OperatorEvent::SloViolation {
                    policy_id: violation.policy_id.clone(),
                    metric: violation.slo.metric.clone(),
                    observed: violation.observed,
                    threshold: violation.slo.threshold,
                    severity: violation.slo.severity,
                    tenant: violation.tenant.clone(),
                });

                for action in &violation.actions {
                    if dry_run {
                        info!(
                            policy_id = %violation.policy_id,
                            action = %action.action_type,
                            target = %action.target,
                            "dry-run: remediation not applied"
                        );
                        REMEDIATIONS
                            .with_label_values(&[action.action_type.as_str(), "dry_run"])
                            .inc();
                        let _ = bus.send(OperatorEvent::RemediationApplied {
                            policy_id: violation.policy_id.clone(),
                            action_type: action.action_type.clone(),
                            target: action.target.clone(),
                            dry_run: true,
                        });
                        continue;
                    }

                    match handlers.get(&action.action_type) {
                        Some(handler) => match handler.apply(action, &violation).await {
                            Ok(()) => {
                                REMEDIATIONS
                                    .with_label_values(&[action.action_type.as_str(), "ok"])
                                    .inc();
                                let _ = bus.send(OperatorEvent::RemediationApplied {
                                    policy_id: violation.policy_id.clone(),
                                    action_type: action.action_type.clone(),
                                    target: action.target.clone(),
                                    dry_run: false,
                                });
                            }
                            // Handler failures are reported, never fatal.
                            Err(err) => {
                                warn!(
                                    policy_id = %violation.policy_id,
                                    action = %action.action_type,
                                    error = %err,
                                    "remediation handler failed"
                                );
                                REMEDIATIONS
                                    .with_label_values(&[action.action_type.as_str(), "error"])
                                    .inc();
                                let _ = bus.send(OperatorEvent::RemediationFailed {
                                    policy_id: violation.policy_id.clone(),
                                    action_type: action.action_type.clone(),
                                    error: err.to_string(),
                                });
                            }
                        },
                        None => {
                            warn!(
                                action = %action.action_type,
                                "no handler registered for remediation action"
                            );
                            REMEDIATIONS
                                .with_label_values(&[action.action_type.as_str(), "unknown"])
                                .inc();
                        }
                    }
                }
            }
        });
        Self {
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop the worker.
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
