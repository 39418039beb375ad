// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Engine error types.
//!
//! Error kinds form a closed set; each maps to a stable code string that
//! survives the wire and drives retry classification. Local, per-stream
//! errors never fail peers; transport failures fan out exactly once.

use thiserror::Error;
use weft_protocol::WireError;

/// Stable error codes for every failure the engine can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Inputs failed schema checks; never retried.
    Validation,
    /// Transport torn down; pending work fails, supervisor restarts.
    TransportClosed,
    /// Outgoing transport queue saturated; retryable.
    Backpressure,
    /// Runtime restarted underneath the caller; retry per policy.
    RuntimeRestart,
    /// Circuit breaker is open; retry after cooldown.
    CircuitOpen,
    /// No such model loaded.
    ModelNotFound,
    /// Handle generation is stale; caller must reload.
    ModelInvalidated,
    /// Too many concurrent streams; callers back off.
    AdmitRejected,
    /// Stream or RPC deadline elapsed.
    Timeout,
    /// Stream-level generation failure; peers unaffected.
    GenerationError,
    /// Cache validation failed; entry evicted, caller repopulates.
    CacheCorrupt,
    /// Consumer cancelled.
    Aborted,
}

impl ErrorCode {
    /// Stable wire representation of this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::TransportClosed => "TRANSPORT_CLOSED",
            ErrorCode::Backpressure => "BACKPRESSURE",
            ErrorCode::RuntimeRestart => "RUNTIME_RESTART",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ModelInvalidated => "MODEL_INVALIDATED",
            ErrorCode::AdmitRejected => "ADMIT_REJECTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::GenerationError => "GENERATION_ERROR",
            ErrorCode::CacheCorrupt => "CACHE_CORRUPT",
            ErrorCode::Aborted => "ABORTED",
        }
    }

    /// Whether a failed attempt with this code may be retried as-is.
    ///
    /// `TransportClosed` is non-retryable within an attempt (the supervisor
    /// owns recovery); `Aborted` is never retryable.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Backpressure
                | ErrorCode::RuntimeRestart
                | ErrorCode::CircuitOpen
                | ErrorCode::AdmitRejected
                | ErrorCode::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for engine operations.
///
/// Clone is required so one transport failure can fan out to every pending
/// stream without re-deriving the error per consumer.
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Inputs failed schema checks.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The transport to the runtime is gone.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The transport's outgoing queue is saturated.
    #[error("transport saturated: {0}")]
    Backpressure(String),

    /// The runtime restarted; in-flight state was invalidated.
    #[error("runtime restarted: {0}")]
    RuntimeRestart(String),

    /// The circuit breaker is rejecting calls.
    #[error("circuit breaker open: {0}")]
    CircuitOpen(String),

    /// The requested model is not loaded.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The model handle references a previous runtime generation.
    #[error("model handle invalidated: {0}")]
    ModelInvalidated(String),

    /// Stream admission was rejected.
    #[error("admission rejected: {0}")]
    AdmitRejected(String),

    /// A deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The runtime reported a generation failure.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Cached artifacts failed validation or could not be stored.
    #[error("cache corrupt: {0}")]
    CacheCorrupt(String),

    /// The consumer cancelled the operation.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl EngineError {
    /// The stable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Validation(_) => ErrorCode::Validation,
            EngineError::TransportClosed(_) => ErrorCode::TransportClosed,
            EngineError::Backpressure(_) => ErrorCode::Backpressure,
            EngineError::RuntimeRestart(_) => ErrorCode::RuntimeRestart,
            EngineError::CircuitOpen(_) => ErrorCode::CircuitOpen,
            EngineError::ModelNotFound(_) => ErrorCode::ModelNotFound,
            EngineError::ModelInvalidated(_) => ErrorCode::ModelInvalidated,
            EngineError::AdmitRejected(_) => ErrorCode::AdmitRejected,
            EngineError::Timeout(_) => ErrorCode::Timeout,
            EngineError::Generation(_) => ErrorCode::GenerationError,
            EngineError::CacheCorrupt(_) => ErrorCode::CacheCorrupt,
            EngineError::Aborted(_) => ErrorCode::Aborted,
        }
    }

    /// Whether this error may be retried as-is. See [`ErrorCode::is_retryable`].
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Build an engine error from a runtime-reported wire error.
    ///
    /// Known codes map back onto their engine variants; anything else is a
    /// generation failure carrying the runtime's message.
    #[must_use]
    pub fn from_wire(wire: &WireError) -> Self {
        let message = wire.message.clone();
        match wire.code.as_str() {
            "VALIDATION" => EngineError::Validation(message),
            "TRANSPORT_CLOSED" => EngineError::TransportClosed(message),
            "BACKPRESSURE" => EngineError::Backpressure(message),
            "RUNTIME_RESTART" => EngineError::RuntimeRestart(message),
            "CIRCUIT_OPEN" => EngineError::CircuitOpen(message),
            "MODEL_NOT_FOUND" => EngineError::ModelNotFound(message),
            "MODEL_INVALIDATED" => EngineError::ModelInvalidated(message),
            "ADMIT_REJECTED" => EngineError::AdmitRejected(message),
            "TIMEOUT" => EngineError::Timeout(message),
            "CACHE_CORRUPT" => EngineError::CacheCorrupt(message),
            "ABORTED" => EngineError::Aborted(message),
            _ => EngineError::Generation(format!("{}: {}", wire.code, message)),
        }
    }

    /// Convert to the wire representation.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code().as_str().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<weft_protocol::ProtocolError> for EngineError {
    fn from(err: weft_protocol::ProtocolError) -> Self {
        EngineError::TransportClosed(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
