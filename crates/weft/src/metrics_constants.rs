// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prometheus metric name constants.
//!
//! All `weft_*` metric names live here so hot paths and dashboards agree on
//! spelling. Conventions: counters end with `_total`, histograms carry a
//! unit suffix, gauges carry neither.

// ============================================================================
// Transport
// ============================================================================

/// Total frames written to the runtime.
pub const METRIC_FRAMES_SENT_TOTAL: &str = "weft_frames_sent_total";

/// Total frames received from the runtime.
pub const METRIC_FRAMES_RECEIVED_TOTAL: &str = "weft_frames_received_total";

/// Total requests rejected because the outgoing queue was saturated.
pub const METRIC_BACKPRESSURE_REJECTS_TOTAL: &str = "weft_backpressure_rejects_total";

/// Total responses that arrived with no pending request.
pub const METRIC_ORPHAN_RESPONSES_TOTAL: &str = "weft_orphan_responses_total";

/// RPC round-trip latency.
pub const METRIC_RPC_LATENCY_MS: &str = "weft_rpc_latency_ms";

// ============================================================================
// Supervisor
// ============================================================================

/// Total runtime restarts.
pub const METRIC_RUNTIME_RESTARTS_TOTAL: &str = "weft_runtime_restarts_total";

/// Circuit breaker state (0 = closed, 1 = half-open, 2 = open).
pub const METRIC_BREAKER_STATE: &str = "weft_breaker_state";

// ============================================================================
// Stream registry
// ============================================================================

/// Streams currently active.
pub const METRIC_ACTIVE_STREAMS: &str = "weft_active_streams";

/// Total streams completed, by terminal state.
pub const METRIC_STREAMS_FINISHED_TOTAL: &str = "weft_streams_finished_total";

/// Total admissions rejected at capacity.
pub const METRIC_ADMIT_REJECTS_TOTAL: &str = "weft_admit_rejects_total";

/// Time to first token per stream.
pub const METRIC_TTFT_MS: &str = "weft_ttft_ms";

// ============================================================================
// Batcher
// ============================================================================

/// Dispatched batch sizes.
pub const METRIC_BATCH_SIZE_COUNT: &str = "weft_batch_size_count";

/// Total batch dispatches.
pub const METRIC_BATCH_DISPATCHES_TOTAL: &str = "weft_batch_dispatches_total";

/// Total dispatch pauses caused by registry backpressure.
pub const METRIC_BATCH_PAUSES_TOTAL: &str = "weft_batch_pauses_total";

// ============================================================================
// Artifact cache
// ============================================================================

/// Total cache hits.
pub const METRIC_CACHE_HITS_TOTAL: &str = "weft_cache_hits_total";

/// Total cache misses.
pub const METRIC_CACHE_MISSES_TOTAL: &str = "weft_cache_misses_total";

/// Total evictions.
pub const METRIC_CACHE_EVICTIONS_TOTAL: &str = "weft_cache_evictions_total";

/// Bytes currently held by cache entries.
pub const METRIC_CACHE_SIZE_BYTES: &str = "weft_cache_size_bytes";

// ============================================================================
// QoS / canary
// ============================================================================

/// Total SLO violations emitted.
pub const METRIC_SLO_VIOLATIONS_TOTAL: &str = "weft_slo_violations_total";

/// Total remediation actions applied.
pub const METRIC_REMEDIATIONS_TOTAL: &str = "weft_remediations_total";

/// Total requests routed, by version.
pub const METRIC_CANARY_ROUTED_TOTAL: &str = "weft_canary_routed_total";

/// Total automatic rollbacks.
pub const METRIC_CANARY_ROLLBACKS_TOTAL: &str = "weft_canary_rollbacks_total";
