// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Length-prefixed framing over a raw byte stream.
//!
//! Every frame is a little-endian `u32` payload length followed by the
//! payload bytes. The decoder accumulates bytes as they arrive and yields
//! whole frames; partial frames stay buffered until completed.

use crate::errors::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum payload length (16 MiB).
///
/// Generation chunks are small; the largest frames are `model/load` results
/// carrying shard listings. 16 MiB leaves generous headroom while bounding
/// the allocation a malformed length prefix can demand.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode one frame (length prefix + payload) into `buf`.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the payload exceeds
/// `max_frame_len` and [`ProtocolError::EmptyFrame`] for empty payloads.
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut, max_frame_len: usize) -> Result<()> {
    if payload.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    if payload.len() > max_frame_len {
        return Err(ProtocolError::FrameTooLarge {
            length: payload.len(),
            max: max_frame_len,
        });
    }
    buf.reserve(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Incremental frame decoder.
///
/// Feed raw bytes with [`FrameDecoder::extend`] and drain whole frames with
/// [`FrameDecoder::next_frame`]. Any framing violation is fatal for the
/// stream: the caller is expected to tear the transport down rather than
/// resynchronize.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Create a decoder with the given maximum payload length.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_len,
        }
    }

    /// Append raw bytes received from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed as frames.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next whole frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] or
    /// [`ProtocolError::EmptyFrame`] when the length prefix is invalid. The
    /// decoder is unusable after an error.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let length = u32::from_le_bytes(header) as usize;

        // Validate before reserving so a corrupt prefix cannot drive a
        // multi-gigabyte allocation.
        if length == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if length > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: self.max_frame_len,
            });
        }

        if self.buf.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payloads: &[&[u8]]) -> Vec<Bytes> {
        let mut wire = BytesMut::new();
        for p in payloads {
            encode_frame(p, &mut wire, DEFAULT_MAX_FRAME_LEN).unwrap();
        }
        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        let mut out = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let frames = roundtrip(&[b"hello"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello");
    }

    #[test]
    fn test_multiple_frames_preserve_order() {
        let frames = roundtrip(&[b"one", b"two", b"three"]);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"one");
        assert_eq!(&frames[1][..], b"two");
        assert_eq!(&frames[2][..], b"three");
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut wire = BytesMut::new();
        encode_frame(b"payload", &mut wire, DEFAULT_MAX_FRAME_LEN).unwrap();

        let mut decoder = FrameDecoder::default();
        // Feed all but the last byte.
        decoder.extend(&wire[..wire.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());

        // Completing the frame yields it.
        decoder.extend(&wire[wire.len() - 1..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&frame[..], b"payload");
    }

    #[test]
    fn test_header_split_across_reads() {
        let mut wire = BytesMut::new();
        encode_frame(b"x", &mut wire, DEFAULT_MAX_FRAME_LEN).unwrap();

        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire[..2]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&wire[2..]);
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"x");
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut decoder = FrameDecoder::new(1024);
        let huge = (4096u32).to_le_bytes();
        decoder.extend(&huge);
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge {
                length: 4096,
                max: 1024
            }
        ));
    }

    #[test]
    fn test_zero_length_prefix_rejected() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&0u32.to_le_bytes());
        assert!(matches!(
            decoder.next_frame().unwrap_err(),
            ProtocolError::EmptyFrame
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; 32];
        let err = encode_frame(&payload, &mut buf, 16).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_little_endian_prefix() {
        let mut buf = BytesMut::new();
        encode_frame(b"abcd", &mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(&buf[..4], &[4, 0, 0, 0]);
    }

    proptest::proptest! {
        /// Whatever the read sizes, frames come out whole and in order.
        #[test]
        fn prop_frames_survive_arbitrary_chunking(
            payloads in proptest::collection::vec(
                proptest::collection::vec(proptest::prelude::any::<u8>(), 1..256),
                1..6,
            ),
            chunk in 1usize..64,
        ) {
            let mut wire = BytesMut::new();
            for payload in &payloads {
                encode_frame(payload, &mut wire, DEFAULT_MAX_FRAME_LEN).unwrap();
            }
            let mut decoder = FrameDecoder::default();
            let mut out = Vec::new();
            for piece in wire.chunks(chunk) {
                decoder.extend(piece);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    out.push(frame.to_vec());
                }
            }
            proptest::prop_assert_eq!(out, payloads);
        }
    }
}
