//! Wire framing protocol.
//!
//! Every chunk travels as one frame: a fixed 8-byte header followed by the
//! raw payload.
//!
//! ```text
//! +----------------+----------------+---------------------+
//! | length (u32)   | seq (u32)      | payload             |
//! | big-endian     | big-endian     | exactly length bytes|
//! +----------------+----------------+---------------------+
//!     4 bytes          4 bytes           variable
//! ```
//!
//! Sequence numbers start at 1 and grow by one per frame for the lifetime of
//! a connection. A gap or repeat means the stream is desynchronized.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Sequence number carried by the first frame on a connection.
pub const FIRST_SEQ: u32 = 1;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes (header excluded).
    pub length: u32,
    /// Frame sequence number.
    pub seq: u32,
}

impl FrameHeader {
    pub fn new(length: u32, seq: u32) -> Self {
        Self { length, seq }
    }

    /// Build the header for a payload of `len` bytes.
    ///
    /// Fails when the payload cannot be described by the 32-bit length field.
    pub fn for_payload(len: usize, seq: u32) -> Result<Self, ProtocolError> {
        let length = u32::try_from(len).map_err(|_| ProtocolError::ChunkTooLarge { len })?;
        Ok(Self::new(length, seq))
    }

    /// Encode into the fixed 8-byte wire layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u32(self.length);
        buf.put_u32(self.seq);
        out
    }

    /// Decode from the fixed 8-byte wire layout.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &raw[..];
        let length = buf.get_u32();
        let seq = buf.get_u32();
        Self::new(length, seq)
    }

    /// Payload length as a buffer size.
    pub fn payload_len(&self) -> usize {
        self.length as usize
    }
}

/// Tracks the next sequence number expected on a connection.
#[derive(Debug, Clone)]
pub struct SeqTracker {
    expected: u32,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self {
            expected: FIRST_SEQ,
        }
    }

    /// Next sequence number that will be accepted.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Accept `seq` if it is the expected one and advance.
    pub fn accept(&mut self, seq: u32) -> Result<(), ProtocolError> {
        if seq != self.expected {
            return Err(ProtocolError::InvalidSeq {
                expected: self.expected,
                actual: seq,
            });
        }
        self.expected = self.expected.wrapping_add(1);
        Ok(())
    }
}

impl Default for SeqTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out outgoing sequence numbers, starting at [`FIRST_SEQ`].
#[derive(Debug, Clone)]
pub struct SeqCounter {
    next: u32,
}

impl SeqCounter {
    pub fn new() -> Self {
        Self { next: FIRST_SEQ }
    }

    /// Take the next sequence number.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }
}

impl Default for SeqCounter {
    fn default() -> Self {
        Self::new()
    }
}
