// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! RPC envelopes, method names, and typed parameter/result structs.
//!
//! Three envelope shapes travel over the framed stream:
//!
//! - [`WireRequest`] `{id, method, params}` — host to runtime.
//! - [`WireResponse`] `{id, result | error}` — runtime to host, correlated
//!   by `id`.
//! - [`StreamEvent`] `{stream_id, kind, ...}` — runtime to host, unsolicited,
//!   one of `chunk`, `stats`, or `event`.
//!
//! [`Incoming`] distinguishes the two runtime-to-host shapes at decode time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names a conforming runtime must implement.
pub mod methods {
    /// Probe the runtime: version, protocol revision, capability flags.
    pub const RUNTIME_INFO: &str = "runtime/info";
    /// Load a model from its source, materializing artifacts.
    pub const MODEL_LOAD: &str = "model/load";
    /// Release a loaded model.
    pub const MODEL_UNLOAD: &str = "model/unload";
    /// Bind a model from previously cached artifacts.
    pub const MODEL_ATTACH: &str = "model/attach";
    /// Tokenize text for a loaded model.
    pub const TOKENIZE: &str = "tokenize";
    /// Inverse of tokenize.
    pub const DETOKENIZE: &str = "detokenize";
    /// Start one generation stream.
    pub const GENERATE: &str = "generate";
    /// Start several generation streams in one call.
    pub const BATCH_GENERATE: &str = "batch_generate";
    /// Cancel an in-flight generation stream.
    pub const CANCEL: &str = "cancel";
}

/// Capability flag advertised by runtimes that implement `batch_generate`.
pub const CAP_BATCH_GENERATE: &str = "batch_generate";

// ============================================================================
// Envelopes
// ============================================================================

/// Host-to-runtime request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    /// Monotonic correlation id, unique per transport.
    pub id: u64,
    /// Method name, see [`methods`].
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// Structured error carried in responses and terminal events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable error code string.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Runtime-to-host response envelope, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    /// Correlation id of the request being answered.
    pub id: u64,
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Unsolicited per-stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Event payload, discriminated by `kind`.
    #[serde(flatten)]
    pub body: StreamEventBody,
}

/// Stream event payloads, discriminated by the wire field `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEventBody {
    /// One generated token.
    Chunk(ChunkEvent),
    /// Periodic generation statistics.
    Stats(StatsEvent),
    /// Terminal lifecycle event.
    Event(TerminalEvent),
}

/// One generated token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEvent {
    /// Token text.
    pub token: String,
    /// Token id in the model vocabulary.
    pub token_id: u32,
    /// Log-probability of the sampled token, when the runtime reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f32>,
    /// True on the last chunk of the stream.
    #[serde(default)]
    pub is_final: bool,
}

/// Generation statistics, reported at stream end and optionally midway.
/// Times are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEvent {
    /// Tokens emitted so far.
    pub tokens_generated: u64,
    /// Decode throughput.
    pub tokens_per_second: f64,
    /// Wall time from request start to first token, in milliseconds.
    pub time_to_first_token: f64,
    /// Total wall time so far, in milliseconds.
    pub total_time: f64,
}

/// Terminal lifecycle event for a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEvent {
    /// Which terminal this is.
    pub event: TerminalKind,
    /// Runtime-reported finish reason (`stop`, `length`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Present for `error` terminals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    /// Always true; terminals end the stream.
    pub is_final: bool,
}

/// Terminal event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// Generation ran to completion.
    Completed,
    /// Generation was cancelled (host- or runtime-initiated).
    Cancelled,
    /// Generation failed.
    Error,
}

/// Anything the runtime can send: a response or a stream event.
///
/// Responses carry `id`; events carry `stream_id` + `kind`. The untagged
/// representation tries responses first, so a frame with both shapes (which
/// no conforming runtime produces) decodes as a response.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    /// Reply to an outstanding request.
    Response(WireResponse),
    /// Out-of-band stream event.
    Event(StreamEvent),
}

// ============================================================================
// Method parameter / result types
// ============================================================================

/// Result of `runtime/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Runtime build version.
    pub version: String,
    /// Protocol revision the runtime speaks.
    pub protocol: u32,
    /// Capability flags, e.g. [`CAP_BATCH_GENERATE`].
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl RuntimeInfo {
    /// Whether the runtime advertises a capability flag.
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Parameters for `model/load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadParams {
    /// Model identifier (registry id or local name).
    pub model_id: String,
    /// `huggingface` or `local`.
    pub source: String,
    /// Filesystem path for `local` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Optional revision pin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Optional quantisation selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    /// Requested context length override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

/// One artifact shard materialized by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Absolute path where the runtime materialized the shard.
    pub path: String,
    /// Shard size in bytes.
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the shard contents.
    pub sha256: String,
}

/// Result of `model/load` and `model/attach`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    /// Runtime-assigned model id.
    pub model_id: String,
    /// Effective context length.
    pub context_length: u32,
    /// Opaque runtime metadata.
    #[serde(default)]
    pub metadata: Value,
    /// Shards the runtime materialized; empty for `model/attach`.
    #[serde(default)]
    pub shards: Vec<ShardDescriptor>,
}

/// Parameters for `model/attach`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachParams {
    /// Cache fingerprint identifying the artifact set.
    pub fingerprint: String,
    /// Directory holding the cached manifest and shards.
    pub artifact_dir: String,
}

/// Parameters for `model/unload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadParams {
    /// Model to release.
    pub model_id: String,
}

/// Parameters for `tokenize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeParams {
    /// Target model.
    pub model_id: String,
    /// Text to tokenize.
    pub text: String,
    /// Prepend the BOS token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_bos: Option<bool>,
}

/// Result of `tokenize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeResult {
    /// Token ids.
    pub tokens: Vec<u32>,
    /// Per-token strings, when the runtime reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_strings: Option<Vec<String>>,
}

/// Parameters for `detokenize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetokenizeParams {
    /// Target model.
    pub model_id: String,
    /// Token ids to join back into text.
    pub tokens: Vec<u32>,
}

/// Result of `detokenize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetokenizeResult {
    /// Reconstructed text.
    pub text: String,
}

/// Sampling parameters for a generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Sampling seed for reproducibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Parameters for `generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Target model.
    pub model_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Host-assigned stream id; all events for this generation carry it.
    pub stream_id: String,
    /// Sampling parameters.
    #[serde(default)]
    pub params: SamplingParams,
}

/// Acknowledgement for `generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateAck {
    /// Echoed stream id.
    pub stream_id: String,
    /// Runtime start timestamp, milliseconds since the Unix epoch.
    pub started_at: u64,
}

/// Parameters for `batch_generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGenerateParams {
    /// Per-stream requests, dispatched together.
    pub requests: Vec<GenerateParams>,
}

/// Per-request outcome inside a `batch_generate` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Whether this request was accepted.
    pub success: bool,
    /// Acknowledgement, present when `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerateAck>,
    /// Failure detail, present when not `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Result of `batch_generate`; `results[i]` answers `requests[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGenerateResult {
    /// Outcomes in request order.
    pub results: Vec<BatchItemResult>,
}

/// Parameters for `cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    /// Stream to cancel.
    pub stream_id: String,
}
