//! Units of data flowing between pipeline stages.

use bytes::Bytes;
use std::time::Instant;

/// One unit of application data, mapped one-to-one to a frame.
///
/// Immutable after creation. Pushing a chunk onto a queue hands ownership to
/// the next stage; cloning only bumps a reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    data: Bytes,
}

impl Chunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the payload.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

/// Record of a sent frame awaiting its echo.
///
/// Created by the sender just before the frame is written and consumed by the
/// verifier once the matching frame comes back.
#[derive(Debug, Clone)]
pub struct StashEntry {
    pub seq: u32,
    pub len: usize,
    pub sent_at: Instant,
    /// Original payload, retained only when verifying by content.
    pub payload: Option<Bytes>,
}

/// A frame read back from the connection, paired with the stash entry it
/// answers.
#[derive(Debug)]
pub struct Received {
    pub entry: StashEntry,
    pub seq: u32,
    pub chunk: Chunk,
    pub received_at: Instant,
}
