//! Error types for the transfer pipeline.
//!
//! Every stage returns a typed result instead of terminating the process.
//! The coordinator collects them and decides the exit status.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage identity, used in diagnostics and totals checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Chunker,
    Sender,
    Receiver,
    Verifier,
}

impl Stage {
    /// Name of the running total this stage reports.
    pub fn total_name(self) -> &'static str {
        match self {
            Stage::Chunker => "read",
            Stage::Sender => "send",
            Stage::Receiver => "receive",
            Stage::Verifier => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Chunker => "chunker",
            Stage::Sender => "sender",
            Stage::Receiver => "receiver",
            Stage::Verifier => "verifier",
        };
        f.write_str(name)
    }
}

/// Top-level error type for a transfer run.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection or file I/O failed (reset, broken pipe, read failure)
    #[error("{stage} transport error: {source}")]
    Transport {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    /// The byte stream no longer follows the framing protocol
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Bytes sent and bytes received disagree
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Stage stopped because a sibling stage failed
    #[error("{stage} cancelled after {total} bytes")]
    Cancelled { stage: Stage, total: u64 },

    /// Stage task panicked or was aborted by the runtime
    #[error("{stage} task failed: {reason}")]
    Join { stage: Stage, reason: String },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transport(stage: Stage, source: io::Error) -> Self {
        Error::Transport { stage, source }
    }

    /// True when the error is only a consequence of another stage's failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// Framing violations. None of these are recoverable: the stream is desynchronized.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid seq: expected {expected}, actual {actual}")]
    InvalidSeq { expected: u32, actual: u32 },

    /// Peer closed mid-unit after some bytes had already arrived
    #[error("Unexpected: {received} of {expected} bytes before close")]
    Truncated { expected: usize, received: usize },

    #[error("chunk of {len} bytes does not fit the 32-bit length field")]
    ChunkTooLarge { len: usize },

    /// Bytes kept arriving after every tracked frame was matched
    #[error("Unexpected: {bytes} trailing bytes after the last frame")]
    TrailingData { bytes: usize },
}

/// End-to-end integrity failures, always reported with both conflicting values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Result not match: {left} {left_total} {right} {right_total}")]
    TotalsMismatch {
        left: &'static str,
        left_total: u64,
        right: &'static str,
        right_total: u64,
    },

    #[error("Messages are not equal: seq {seq}")]
    ContentMismatch { seq: u32 },

    #[error("length mismatch for seq {seq}: sent {expected}, received {actual}")]
    LengthMismatch {
        seq: u32,
        expected: usize,
        actual: usize,
    },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_data_message() {
        let err = Error::from(ProtocolError::TrailingData { bytes: 12 });
        assert_eq!(
            err.to_string(),
            "Unexpected: 12 trailing bytes after the last frame"
        );
    }

    #[test]
    fn test_invalid_seq_message() {
        let err = Error::from(ProtocolError::InvalidSeq {
            expected: 2,
            actual: 3,
        });
        assert_eq!(err.to_string(), "Invalid seq: expected 2, actual 3");
    }

    #[test]
    fn test_totals_mismatch_message() {
        let err = IntegrityError::TotalsMismatch {
            left: "send",
            left_total: 1200,
            right: "receive",
            right_total: 600,
        };
        assert_eq!(err.to_string(), "Result not match: send 1200 receive 600");
    }

    #[test]
    fn test_cancelled() {
        let err = Error::Cancelled {
            stage: Stage::Receiver,
            total: 600,
        };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "receiver cancelled after 600 bytes");

        let err = Error::transport(Stage::Sender, io::ErrorKind::BrokenPipe.into());
        assert!(!err.is_cancelled());
    }
}
