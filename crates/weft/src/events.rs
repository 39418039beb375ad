// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Operator event bus.
//!
//! Structured events for humans and automation: SLO violations,
//! remediation outcomes, canary rollbacks. Everything here is advisory;
//! dropping events (slow subscriber) never affects serving.

use crate::qos::policy::Severity;
use tokio::sync::broadcast;

/// Events published on the operator bus.
#[derive(Debug, Clone)]
pub enum OperatorEvent {
    /// An SLO breached its threshold.
    SloViolation {
        /// Violated policy.
        policy_id: String,
        /// Metric that breached.
        metric: String,
        /// Observed percentile value.
        observed: f64,
        /// Configured threshold.
        threshold: f64,
        /// Severity from the policy.
        severity: Severity,
        /// Tenant scope, when the violation is tenant-specific.
        tenant: Option<String>,
    },
    /// A remediation handler ran.
    RemediationApplied {
        /// Policy that demanded it.
        policy_id: String,
        /// Handler name.
        action_type: String,
        /// Handler target.
        target: String,
        /// True when dry-run mode logged instead of applying.
        dry_run: bool,
    },
    /// A remediation handler failed; evaluation continues.
    RemediationFailed {
        /// Policy that demanded it.
        policy_id: String,
        /// Handler name.
        action_type: String,
        /// Failure detail.
        error: String,
    },
    /// An explicit `alert` remediation fired.
    Alert {
        /// Policy that demanded it.
        policy_id: String,
        /// Alert target (channel, pager key, ...).
        target: String,
        /// Reason from the policy.
        reason: String,
        /// Severity of the underlying violation.
        severity: Severity,
    },
    /// The canary controller rolled the variant back to 0%.
    CanaryRollback {
        /// Which threshold tripped.
        reason: String,
        /// Variant error rate at decision time.
        variant_error_rate: f64,
        /// Baseline error rate at decision time.
        baseline_error_rate: f64,
        /// Variant p99 latency at decision time.
        variant_p99_ms: f64,
    },
}

/// Shared operator bus handle.
pub type OperatorBus = broadcast::Sender<OperatorEvent>;

/// Create an operator bus with a reasonable buffer.
#[must_use]
pub fn operator_bus() -> OperatorBus {
    broadcast::channel(256).0
}
