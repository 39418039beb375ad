// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use thiserror::Error;

/// Error types for protocol framing and envelope handling
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum length
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared payload length
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// Frame declared a zero-length payload
    #[error("frame declared an empty payload")]
    EmptyFrame,

    /// Payload was not valid JSON or did not match any envelope shape
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// IO error on the underlying byte stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
