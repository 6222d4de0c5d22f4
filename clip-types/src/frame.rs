//! Length-prefixed framing.
//!
//! Every envelope travels as a 4-byte big-endian length followed by exactly
//! that many bytes of JSON. The same framing is used on the direct channel
//! and the relay channel.

use crate::{Envelope, WireError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default maximum payload length (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encodes payloads into frames, enforcing a maximum length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Create a codec with the given maximum payload length.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// The configured maximum payload length.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Frame raw payload bytes.
    ///
    /// Oversized payloads are rejected, never truncated.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(WireError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Serialize and frame an envelope.
    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>, WireError> {
        self.encode(&envelope.to_json_bytes()?)
    }

    /// Try to split one frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete (including a partial
    /// length prefix). Returns the payload and the number of bytes consumed
    /// once the full frame is present. A declared length above the maximum is
    /// an error regardless of how many bytes have arrived.
    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<Option<(&'a [u8], usize)>, WireError> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if declared > self.max_frame_len {
            return Err(WireError::FrameTooLarge {
                len: declared,
                max: self.max_frame_len,
            });
        }
        let total = LENGTH_PREFIX_LEN + declared;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((&buf[LENGTH_PREFIX_LEN..total], total)))
    }
}

/// Streaming decoder that buffers bytes until whole frames are available.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder with the given maximum payload length.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            codec: FrameCodec::new(max_frame_len),
            buffer: Vec::new(),
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload, if one is buffered.
    ///
    /// An error means the stream is unusable and the connection should close.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        let Some((payload, consumed)) = self.codec.decode(&self.buffer)? else {
            return Ok(None);
        };
        let payload = payload.to_vec();
        self.buffer.drain(..consumed);
        Ok(Some(payload))
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
