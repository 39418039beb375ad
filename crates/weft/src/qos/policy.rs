// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! SLO policies and the versioned policy store.
//!
//! Policies are loaded at startup and editable at runtime; every edit bumps
//! the store version and emits a change event so evaluator caches drop
//! their stale match tables. Tenant-scoped policies shadow global ones for
//! matching tenants; higher `priority` wins on conflict.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Violation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Actively harming service.
    Critical,
}

/// One service-level objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slo {
    /// Metric name, e.g. `ttft_ms`.
    pub metric: String,
    /// Percentile evaluated over the window (0.0 - 1.0).
    #[serde(default = "default_percentile")]
    pub percentile: f64,
    /// Threshold the percentile must stay under.
    pub threshold: f64,
    /// Evaluation window in milliseconds.
    pub window_ms: u64,
    /// Severity when breached.
    pub severity: Severity,
    /// Tenant scope; `None` applies to all tenants not shadowed by a
    /// tenant-scoped policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

fn default_percentile() -> f64 {
    0.99
}

/// One declarative remediation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    /// Handler name: `scale_up`, `scale_down`, `reject`, `alert`, or a
    /// custom registration.
    pub action_type: String,
    /// What the action operates on (handler-specific).
    pub target: String,
    /// Handler parameters.
    #[serde(default)]
    pub params: Value,
    /// Why this action is part of the policy; carried into operator
    /// events.
    pub reason: String,
}

/// A QoS policy: SLOs plus ordered remediations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy id.
    pub id: String,
    /// Conflict precedence; higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Disabled policies never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Objectives.
    pub slos: Vec<Slo>,
    /// Remediations, applied in order on violation.
    #[serde(default)]
    pub actions: Vec<RemediationAction>,
}

fn default_enabled() -> bool {
    true
}

/// Store change notifications.
#[derive(Debug, Clone)]
pub enum PolicyChange {
    /// A policy was added or replaced.
    Upserted(String),
    /// A policy was removed.
    Removed(String),
    /// The whole set was reloaded.
    Reloaded,
}

/// Versioned, runtime-editable policy store.
pub struct PolicyStore {
    policies: RwLock<HashMap<String, Arc<Policy>>>,
    version: AtomicU64,
    changes: broadcast::Sender<PolicyChange>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            policies: RwLock::new(HashMap::new()),
            version: AtomicU64::new(1),
            changes,
        }
    }

    /// Replace the whole policy set.
    pub fn load(&self, policies: Vec<Policy>) {
        let mut map = HashMap::with_capacity(policies.len());
        for policy in policies {
            map.insert(policy.id.clone(), Arc::new(policy));
        }
        *self.policies.write() = map;
        self.version.fetch_add(1, Ordering::AcqRel);
        let _ = self.changes.send(PolicyChange::Reloaded);
    }

    /// Add or replace one policy.
    pub fn upsert(&self, policy: Policy) {
        let id = policy.id.clone();
        self.policies.write().insert(id.clone(), Arc::new(policy));
        self.version.fetch_add(1, Ordering::AcqRel);
        let _ = self.changes.send(PolicyChange::Upserted(id));
    }

    /// Remove one policy. No-op for unknown ids.
    pub fn remove(&self, id: &str) {
        if self.policies.write().remove(id).is_some() {
            self.version.fetch_add(1, Ordering::AcqRel);
            let _ = self.changes.send(PolicyChange::Removed(id.to_string()));
        }
    }

    /// Fetch one policy.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Policy>> {
        self.policies.read().get(id).cloned()
    }

    /// All policies, unordered.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Policy>> {
        self.policies.read().values().cloned().collect()
    }

    /// Monotonic store version; bumps on every edit.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Subscribe to change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.changes.subscribe()
    }

    /// Enabled policies with an SLO for `metric` that applies to `tenant`,
    /// highest priority first. Tenant-scoped matches shadow global ones.
    #[must_use]
    pub fn matching(&self, metric: &str, tenant: Option<&str>) -> Vec<Arc<Policy>> {
        let policies = self.policies.read();
        let mut tenant_scoped = Vec::new();
        let mut global = Vec::new();
        for policy in policies.values() {
            if !policy.enabled {
                continue;
            }
            let mut matches_tenant_scoped = false;
            let mut matches_global = false;
            for slo in &policy.slos {
                if slo.metric != metric {
                    continue;
                }
                match (&slo.tenant_id, tenant) {
                    (Some(scope), Some(t)) if scope == t => matches_tenant_scoped = true,
                    (None, _) => matches_global = true,
                    _ => {}
                }
            }
            if matches_tenant_scoped {
                tenant_scoped.push(Arc::clone(policy));
            } else if matches_global {
                global.push(Arc::clone(policy));
            }
        }
        let mut result = if tenant.is_some() && !tenant_scoped.is_empty() {
            tenant_scoped
        } else {
            global
        };
        result.sort_by_key(|p| std::cmp::Reverse(p.priority));
        result
    }
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("policies", &self.policies.read().len())
            .field("version", &self.version())
            .finish()
    }
}
