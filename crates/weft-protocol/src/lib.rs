// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Weft Runtime Protocol
//!
//! Wire layer shared by the weft orchestration core and any process that
//! implements the model-runtime side of the bridge.
//!
//! The protocol is deliberately small:
//!
//! - **Framing**: every message is a length-prefixed blob — a little-endian
//!   `u32` byte length followed by a JSON payload ([`frames`]).
//! - **Envelopes**: a frame carries either a request `{id, method, params}`,
//!   a response `{id, result | error}`, or an unsolicited stream event
//!   `{stream_id, kind, ...}` ([`rpc`]).
//! - **Methods**: the minimum method set a runtime must implement is listed
//!   in [`rpc::methods`], with typed parameter/result structs alongside.
//!
//! Requests are correlated with responses by `id`, never by order. Stream
//! events are correlated by `stream_id` and may interleave arbitrarily with
//! responses on the same byte stream.

pub mod errors;
pub mod frames;
pub mod rpc;

pub use errors::{ProtocolError, Result};
pub use frames::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN};
pub use rpc::{
    AttachParams, BatchGenerateParams, BatchGenerateResult, BatchItemResult, CancelParams,
    ChunkEvent, DetokenizeParams, DetokenizeResult, GenerateAck, GenerateParams, Incoming,
    LoadParams, LoadResult, RuntimeInfo, SamplingParams, ShardDescriptor, StatsEvent, StreamEvent,
    StreamEventBody, TerminalEvent, TerminalKind, TokenizeParams, TokenizeResult, UnloadParams,
    WireError, WireRequest, WireResponse, CAP_BATCH_GENERATE,
};
