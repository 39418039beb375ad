// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Hierarchical YAML configuration.
//!
//! A base file carries the full configuration; an optional environment
//! overlay is deep-merged on top (mappings merge key-wise, everything else
//! replaces). Defaults are tuned for a single Apple-silicon runtime on the
//! same host; override per deployment.

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default RPC deadline. Model loads override this per call.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default outgoing queue depth (frames, not bytes).
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 256;

/// Default outgoing high-water mark in bytes. Above this, submissions fail
/// fast instead of queueing.
pub const DEFAULT_HIGH_WATER_BYTES: usize = 4 * 1024 * 1024;

/// Default startup probe deadline for the runtime subprocess.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 20_000;

/// Default graceful shutdown deadline before the child is killed.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default restart budget before the supervisor goes fatal.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Default per-stream inactivity timeout.
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 120_000;

/// Default grace period during which late events for a finished stream are
/// dropped idempotently rather than logged as unknown.
pub const DEFAULT_STREAM_GRACE_MS: u64 = 2_000;

/// Default bound on each stream's token queue.
pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 64;

// ============================================================================
// Sections
// ============================================================================

/// Transport timeouts and buffer sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Per-RPC deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Outgoing queue depth in frames.
    pub write_queue_depth: usize,
    /// Outgoing high-water mark in bytes.
    pub high_water_bytes: usize,
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            high_water_bytes: DEFAULT_HIGH_WATER_BYTES,
            max_frame_bytes: weft_protocol::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl TransportConfig {
    /// Per-RPC deadline as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Runtime subprocess launch and restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Runtime executable.
    pub command: String,
    /// Arguments passed to the runtime.
    pub args: Vec<String>,
    /// Extra environment variables for the runtime.
    pub env: HashMap<String, String>,
    /// Startup probe deadline in milliseconds.
    pub startup_timeout_ms: u64,
    /// Graceful shutdown deadline in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Restarts attempted before entering `fatal`.
    pub max_restarts: u32,
    /// Initial restart backoff in milliseconds.
    pub restart_backoff_initial_ms: u64,
    /// Restart backoff cap in milliseconds.
    pub restart_backoff_max_ms: u64,
    /// Consecutive failures that open the circuit breaker.
    pub breaker_failure_threshold: u32,
    /// Breaker cooldown before a half-open probe, in milliseconds.
    pub breaker_cooldown_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: "weft-runtime".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff_initial_ms: 500,
            restart_backoff_max_ms: 10_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

/// Stream registry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Maximum concurrently active streams.
    pub max_active_streams: usize,
    /// Default per-stream inactivity timeout in milliseconds.
    pub default_stream_timeout_ms: u64,
    /// Grace period after a terminal transition, in milliseconds.
    pub grace_ms: u64,
    /// Per-stream token queue capacity.
    pub queue_capacity: usize,
    /// Inactivity sweep interval in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_active_streams: 256,
            default_stream_timeout_ms: DEFAULT_STREAM_TIMEOUT_MS,
            grace_ms: DEFAULT_STREAM_GRACE_MS,
            queue_capacity: DEFAULT_STREAM_QUEUE_CAPACITY,
            sweep_interval_ms: 1_000,
        }
    }
}

/// Micro-batching policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatcherConfig {
    /// Smallest batch worth dispatching once `min_hold_ms` has elapsed.
    pub min_batch_size: usize,
    /// Hard ceiling on batch size.
    pub max_batch_size: usize,
    /// Starting point for the adaptive target size.
    pub initial_target_batch_size: usize,
    /// Minimum hold window in milliseconds.
    pub min_hold_ms: u64,
    /// Maximum hold window in milliseconds.
    pub max_hold_ms: u64,
    /// Wall-time target for one dispatched batch, in milliseconds. The
    /// adaptive sizer grows the target batch below 0.8x and shrinks above
    /// 1.2x of this.
    pub target_batch_time_ms: u64,
    /// Extra hold granted to background-priority work on first visit.
    pub background_hold_extension_ms: u64,
    /// Dispatch pause when the registry is saturated, in milliseconds.
    pub pause_on_backpressure_ms: u64,
    /// Registry utilisation that triggers the pause (0.0 - 1.0).
    pub backpressure_utilization: f64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 32,
            initial_target_batch_size: 4,
            min_hold_ms: 5,
            max_hold_ms: 50,
            target_batch_time_ms: 500,
            background_hold_extension_ms: 25,
            pause_on_backpressure_ms: 100,
            backpressure_utilization: 0.9,
        }
    }
}

/// Artifact cache placement and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache directory root.
    pub directory: PathBuf,
    /// Total size cap in bytes across all entries.
    pub max_size_bytes: u64,
    /// Verify shard hashes against manifests at startup.
    pub validate_on_startup: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/cache/weft/models"),
            max_size_bytes: 64 * 1024 * 1024 * 1024,
            validate_on_startup: true,
        }
    }
}

/// QoS control plane switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QosConfig {
    /// Master switch.
    pub enabled: bool,
    /// Evaluate SLO policies on ingested samples.
    pub evaluator_enabled: bool,
    /// Dispatch remediation actions on violations.
    pub executor_enabled: bool,
    /// Load and watch the policy store.
    pub store_enabled: bool,
    /// Log remediations without applying them.
    pub dry_run: bool,
    /// Default SLO window when a policy omits one, in milliseconds.
    pub default_window_ms: u64,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluator_enabled: true,
            executor_enabled: true,
            store_enabled: true,
            dry_run: false,
            default_window_ms: 60_000,
        }
    }
}

/// Canary routing and rollback policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanaryConfig {
    /// Master switch; when off, everything routes to baseline.
    pub enabled: bool,
    /// Percentage of traffic routed to the variant (0-100).
    pub rollout_percentage: u8,
    /// Seed mixed into the routing hash; changing it reshuffles buckets.
    pub hash_seed: String,
    /// Variant-minus-baseline error-rate delta that triggers rollback.
    pub error_rate_delta: f64,
    /// Variant p99 latency that triggers rollback, in milliseconds.
    pub p99_latency_threshold_ms: f64,
    /// Rollback evaluation interval in milliseconds.
    pub evaluation_window_ms: u64,
    /// Rollout freeze after a rollback, in milliseconds.
    pub cooldown_ms: u64,
    /// Minimum variant samples before rollback logic engages.
    pub min_samples: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rollout_percentage: 0,
            hash_seed: "weft".to_string(),
            error_rate_delta: 0.05,
            p99_latency_threshold_ms: 2_000.0,
            evaluation_window_ms: 30_000,
            cooldown_ms: 300_000,
            min_samples: 20,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeftConfig {
    /// Transport timeouts and buffers.
    pub transport: TransportConfig,
    /// Baseline runtime launch policy.
    pub supervisor: SupervisorConfig,
    /// Variant runtime launch policy; absent means no canary lane.
    pub variant_supervisor: Option<SupervisorConfig>,
    /// Stream registry limits.
    pub registry: RegistryConfig,
    /// Micro-batching policy.
    pub batcher: BatcherConfig,
    /// Artifact cache placement.
    pub cache: CacheConfig,
    /// QoS switches.
    pub qos: QosConfig,
    /// Canary policy.
    pub canary: CanaryConfig,
}

impl WeftConfig {
    /// Parse a configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the YAML is malformed, contains unknown
    /// fields, or fails range checks.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: WeftConfig = serde_yml::from_str(yaml)
            .map_err(|e| EngineError::Validation(format!("config parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a base file plus an optional environment overlay.
    ///
    /// Overlay mappings merge key-wise into the base; scalars and sequences
    /// in the overlay replace the base value.
    ///
    /// # Errors
    ///
    /// Returns `Validation` on IO failure, malformed YAML, or range checks.
    pub fn load_layered(base: &Path, overlay: Option<&Path>) -> Result<Self> {
        let base_text = std::fs::read_to_string(base)
            .map_err(|e| EngineError::Validation(format!("config read {}: {e}", base.display())))?;
        let mut value: serde_yml::Value = serde_yml::from_str(&base_text)
            .map_err(|e| EngineError::Validation(format!("config parse {}: {e}", base.display())))?;

        if let Some(overlay_path) = overlay {
            let overlay_text = std::fs::read_to_string(overlay_path).map_err(|e| {
                EngineError::Validation(format!("config read {}: {e}", overlay_path.display()))
            })?;
            let overlay_value: serde_yml::Value =
                serde_yml::from_str(&overlay_text).map_err(|e| {
                    EngineError::Validation(format!(
                        "config parse {}: {e}",
                        overlay_path.display()
                    ))
                })?;
            deep_merge(&mut value, overlay_value);
        }

        let config: WeftConfig = serde_yml::from_value(value)
            .map_err(|e| EngineError::Validation(format!("config merge: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants. Field paths appear in error messages.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.transport.write_queue_depth == 0 {
            return Err(EngineError::Validation(
                "transport.write_queue_depth must be > 0".into(),
            ));
        }
        if self.registry.max_active_streams == 0 {
            return Err(EngineError::Validation(
                "registry.max_active_streams must be > 0".into(),
            ));
        }
        if self.registry.queue_capacity == 0 {
            return Err(EngineError::Validation(
                "registry.queue_capacity must be > 0".into(),
            ));
        }
        if self.batcher.min_batch_size == 0 {
            return Err(EngineError::Validation(
                "batcher.min_batch_size must be > 0".into(),
            ));
        }
        if self.batcher.max_batch_size < self.batcher.min_batch_size {
            return Err(EngineError::Validation(
                "batcher.max_batch_size must be >= batcher.min_batch_size".into(),
            ));
        }
        if self.batcher.initial_target_batch_size < self.batcher.min_batch_size
            || self.batcher.initial_target_batch_size > self.batcher.max_batch_size
        {
            return Err(EngineError::Validation(
                "batcher.initial_target_batch_size must lie within [min_batch_size, max_batch_size]"
                    .into(),
            ));
        }
        if self.batcher.max_hold_ms < self.batcher.min_hold_ms {
            return Err(EngineError::Validation(
                "batcher.max_hold_ms must be >= batcher.min_hold_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.batcher.backpressure_utilization) {
            return Err(EngineError::Validation(
                "batcher.backpressure_utilization must lie within [0.0, 1.0]".into(),
            ));
        }
        if self.cache.max_size_bytes == 0 {
            return Err(EngineError::Validation(
                "cache.max_size_bytes must be > 0".into(),
            ));
        }
        if self.canary.rollout_percentage > 100 {
            return Err(EngineError::Validation(
                "canary.rollout_percentage must lie within [0, 100]".into(),
            ));
        }
        if self.canary.enabled && self.variant_supervisor.is_none() {
            return Err(EngineError::Validation(
                "canary.enabled requires variant_supervisor".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.canary.error_rate_delta) {
            return Err(EngineError::Validation(
                "canary.error_rate_delta must lie within [0.0, 1.0]".into(),
            ));
        }
        Ok(())
    }
}

/// Key-wise merge of `overlay` into `base`: mappings recurse, everything
/// else replaces.
fn deep_merge(base: &mut serde_yml::Value, overlay: serde_yml::Value) {
    match (base, overlay) {
        (serde_yml::Value::Mapping(base_map), serde_yml::Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
