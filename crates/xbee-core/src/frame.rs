//! API frame codec
//!
//! Wire layout (length is big-endian and counts `api_id` + payload):
//!
//! ```text
//! 0x7E | len_hi | len_lo | api_id | payload ... | checksum
//! ```
//!
//! `checksum = 0xFF - (api_id + sum(payload)) mod 256`.
//!
//! [`decode`] works on arbitrary stream prefixes and reports
//! [`Decoded::NeedMoreData`] until a whole frame is buffered, which makes it
//! safe to feed with partial serial reads. [`FrameDecoder`] wraps it with a
//! growable buffer and the resynchronization policy: on a checksum mismatch
//! exactly one byte is dropped and scanning restarts at the next delimiter.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

/// Start-of-frame delimiter
pub const START_DELIMITER: u8 = 0x7E;

/// Delimiter + two length bytes + checksum
pub const FRAME_OVERHEAD: usize = 4;

/// Largest payload that fits the 16-bit length field (api id takes one byte)
pub const MAX_PAYLOAD: usize = u16::MAX as usize - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
    #[error("{kind} payload too short: need {needed} bytes, got {actual}")]
    Truncated {
        kind: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// One validated API frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFrame {
    pub api_id: u8,
    pub payload: Vec<u8>,
}

impl ApiFrame {
    pub fn new(api_id: u8, payload: Vec<u8>) -> Self {
        Self { api_id, payload }
    }

    /// Value of the length field (api id + payload)
    pub fn length(&self) -> usize {
        self.payload.len() + 1
    }

    pub fn checksum(&self) -> u8 {
        checksum(self.api_id, &self.payload)
    }

    /// Serialize into the full wire form
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let length = self.length() as u16;
        let mut out = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD + 1);
        out.push(START_DELIMITER);
        out.extend_from_slice(&length.to_be_bytes());
        out.push(self.api_id);
        out.extend_from_slice(&self.payload);
        out.push(self.checksum());
        Ok(out)
    }
}

/// Compute the frame checksum over the api id and payload
pub fn checksum(api_id: u8, payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(api_id, |acc, &b| acc.wrapping_add(b));
    0xFF - sum
}

/// Outcome of decoding from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A valid frame starting at offset 0, spanning `consumed` bytes
    Frame { frame: ApiFrame, consumed: usize },
    /// The buffer holds a frame prefix only
    NeedMoreData,
    /// The bytes at offset 0 do not form a valid frame
    Invalid,
}

/// Decode a frame that starts at `buf[0]`
///
/// The caller is responsible for positioning `buf` on a delimiter;
/// a buffer that does not start with one is reported as [`Decoded::Invalid`].
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.is_empty() {
        return Decoded::NeedMoreData;
    }
    if buf[0] != START_DELIMITER {
        return Decoded::Invalid;
    }
    if buf.len() < 5 {
        return Decoded::NeedMoreData;
    }

    let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if length == 0 {
        return Decoded::Invalid;
    }
    let total = length + FRAME_OVERHEAD;
    if buf.len() < total {
        return Decoded::NeedMoreData;
    }

    let api_id = buf[3];
    let payload = &buf[4..3 + length];
    let received = buf[3 + length];
    if checksum(api_id, payload) != received {
        return Decoded::Invalid;
    }

    Decoded::Frame {
        frame: ApiFrame::new(api_id, payload.to_vec()),
        consumed: total,
    }
}

/// A decoded frame together with the exact wire bytes it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub frame: ApiFrame,
    pub wire: Vec<u8>,
}

/// Streaming decoder fed with serial reads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet decoded bytes
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pull the next valid frame out of the buffer, if one is complete
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            // Sync up to the first candidate delimiter
            match self.buffer.iter().position(|&b| b == START_DELIMITER) {
                Some(0) => {}
                Some(idx) => {
                    trace!(skipped = idx, "Discarding bytes before delimiter");
                    self.buffer.advance(idx);
                }
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            match decode(&self.buffer) {
                Decoded::Frame { frame, consumed } => {
                    let wire = self.buffer.split_to(consumed).to_vec();
                    return Some(RawFrame { frame, wire });
                }
                Decoded::NeedMoreData => return None,
                Decoded::Invalid => {
                    debug!(
                        buffered = self.buffer.len(),
                        "Invalid frame, resynchronizing"
                    );
                    self.buffer.advance(1);
                }
            }
        }
    }
}
