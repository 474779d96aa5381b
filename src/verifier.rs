//! Echo verification.
//!
//! The sender records every frame in the stash, a bounded FIFO whose capacity
//! equals the configured channel size. That capacity bounds how far the send
//! side can run ahead of the receive side before it blocks, which keeps the
//! retained payloads bounded in memory.
//!
//! Frames come back in send order (TCP is ordered and sequence numbers are
//! checked), so the oldest stash entry is always the one a received frame
//! answers. Per-chunk checks fail fast; the coordinator compares the stage
//! totals once every stage has finished.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chunk::{Chunk, Received, StashEntry};
use crate::config::TransferCondition;
use crate::error::{Error, IntegrityError, Result, Stage};
use crate::pipeline::until_cancelled;
use crate::sink::Sink;

/// How echoed chunks are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Keep every sent payload until its echo arrives and compare bytes.
    #[default]
    Content,
    /// Keep only lengths; compare running totals.
    Totals,
}

impl VerifyMode {
    pub fn retains_payload(self) -> bool {
        matches!(self, VerifyMode::Content)
    }
}

/// Send half of the stash.
#[derive(Debug, Clone)]
pub struct StashSender {
    tx: mpsc::Sender<StashEntry>,
    mode: VerifyMode,
}

impl StashSender {
    pub fn mode(&self) -> VerifyMode {
        self.mode
    }

    /// Record an entry, waiting while the stash is full.
    ///
    /// Returns the entry back when the receive side has already finished.
    pub async fn push(&self, entry: StashEntry) -> std::result::Result<(), StashEntry> {
        self.tx.send(entry).await.map_err(|e| e.0)
    }
}

/// Receive half of the stash.
#[derive(Debug)]
pub struct StashReceiver {
    rx: mpsc::Receiver<StashEntry>,
}

impl StashReceiver {
    /// Oldest unmatched entry, or `None` once the sender sealed the stash and
    /// every entry has been taken.
    pub async fn pop(&mut self) -> Option<StashEntry> {
        self.rx.recv().await
    }
}

/// Create a stash holding at most `capacity` in-flight entries.
pub fn stash(capacity: usize, mode: VerifyMode) -> (StashSender, StashReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (StashSender { tx, mode }, StashReceiver { rx })
}

/// Compare a received chunk with the entry recorded when it was sent.
pub fn verify(entry: &StashEntry, chunk: &Chunk) -> std::result::Result<(), IntegrityError> {
    if entry.len != chunk.len() {
        return Err(IntegrityError::LengthMismatch {
            seq: entry.seq,
            expected: entry.len,
            actual: chunk.len(),
        });
    }
    if let Some(payload) = &entry.payload {
        if payload.as_ref() != chunk.as_bytes() {
            return Err(IntegrityError::ContentMismatch { seq: entry.seq });
        }
    }
    Ok(())
}

/// Round-trip latency of matched chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

impl LatencyStats {
    pub fn record(&mut self, rtt: Duration) {
        if self.count == 0 || rtt < self.min {
            self.min = rtt;
        }
        if rtt > self.max {
            self.max = rtt;
        }
        self.total += rtt;
        self.count += 1;
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        // u32 division is enough for any realistic frame count per run.
        match u32::try_from(self.count) {
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

/// What the verifier stage reports when it finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VerifyReport {
    /// Bytes handed to the sink.
    pub written: u64,
    pub frames: u64,
    pub latency: LatencyStats,
}

/// Verify every received chunk in arrival order and hand it to the sink.
pub async fn run(
    cond: TransferCondition,
    mut received: mpsc::Receiver<Received>,
    mut sink: Sink,
    cancel: CancellationToken,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    loop {
        let item = until_cancelled(&cancel, Stage::Verifier, report.written, received.recv())
            .await?;
        let Some(item) = item else {
            break;
        };

        verify(&item.entry, &item.chunk)?;
        report
            .latency
            .record(item.received_at.saturating_duration_since(item.entry.sent_at));

        until_cancelled(&cancel, Stage::Verifier, report.written, sink.consume(&item.chunk))
            .await?
            .map_err(|e| Error::transport(Stage::Verifier, e))?;
        report.written += item.chunk.len() as u64;
        report.frames += 1;

        if cond.verbose {
            trace!(seq = item.seq, len = item.chunk.len(), "Verified");
        }
    }

    until_cancelled(&cancel, Stage::Verifier, report.written, sink.finish())
        .await?
        .map_err(|e| Error::transport(Stage::Verifier, e))?;

    debug!(
        written = report.written,
        frames = report.frames,
        "Verifier finished"
    );
    Ok(report)
}

/// Running totals reported by each stage.
///
/// `received` and `written` are absent when the receive side is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub read: u64,
    pub sent: u64,
    pub received: Option<u64>,
    pub written: Option<u64>,
}

impl Totals {
    /// Every pair of adjacent stages must agree to the byte.
    pub fn check(&self) -> std::result::Result<(), IntegrityError> {
        let mut chain = vec![(Stage::Chunker, self.read), (Stage::Sender, self.sent)];
        if let Some(received) = self.received {
            chain.push((Stage::Receiver, received));
        }
        if let Some(written) = self.written {
            chain.push((Stage::Verifier, written));
        }

        for pair in chain.windows(2) {
            let (left, left_total) = pair[0];
            let (right, right_total) = pair[1];
            if left_total != right_total {
                return Err(IntegrityError::TotalsMismatch {
                    left: left.total_name(),
                    left_total,
                    right: right.total_name(),
                    right_total,
                });
            }
        }
        Ok(())
    }
}
