//! Receiver/deframer stage.
//!
//! Reads frames back from the connection, validates sequence numbers and
//! pairs every frame with the oldest stash entry before handing it to the
//! verifier.
//!
//! The receive side ends on the first of:
//! - the stash is sealed and drained (every sent frame has been matched) and
//!   the peer has closed without sending anything more
//! - the known transfer target has been reached
//! - the peer closes the connection between frames

use bytes::BytesMut;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::chunk::{Chunk, Received};
use crate::config::TransferCondition;
use crate::connection::{read_full, ReadError, ReadOutcome};
use crate::error::{Error, IntegrityError, ProtocolError, Result, Stage};
use crate::pipeline::until_cancelled;
use crate::protocol::{FrameHeader, SeqTracker, HEADER_LEN};
use crate::verifier::StashReceiver;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub chunk: Chunk,
}

/// How long the peer may keep the connection open once every frame is back.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Read one frame whose payload should be `expected_len` bytes.
///
/// Returns `Ok(None)` when the peer closed cleanly before the header started.
/// Closing anywhere inside a frame is a truncation error. A header announcing
/// any other length is rejected before the payload is read.
pub async fn read_frame<R>(
    reader: &mut R,
    seqs: &mut SeqTracker,
    expected_len: usize,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; HEADER_LEN];
    match read_full(reader, &mut raw).await.map_err(read_error)? {
        ReadOutcome::Closed => return Ok(None),
        ReadOutcome::Complete => {}
    }

    let header = FrameHeader::decode(&raw);
    seqs.accept(header.seq)?;

    let len = header.payload_len();
    if len != expected_len {
        return Err(IntegrityError::LengthMismatch {
            seq: header.seq,
            expected: expected_len,
            actual: len,
        }
        .into());
    }
    if len == 0 {
        return Ok(Some(Frame {
            header,
            chunk: Chunk::new(BytesMut::new().freeze()),
        }));
    }

    let mut payload = BytesMut::zeroed(len);
    match read_full(reader, &mut payload[..]).await {
        Ok(ReadOutcome::Complete) => {}
        Ok(ReadOutcome::Closed) => {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN + len,
                received: HEADER_LEN,
            }
            .into())
        }
        Err(ReadError::Protocol(ProtocolError::Truncated { received, .. })) => {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN + len,
                received: HEADER_LEN + received,
            }
            .into())
        }
        Err(e) => return Err(read_error(e)),
    }

    Ok(Some(Frame {
        header,
        chunk: Chunk::new(payload.freeze()),
    }))
}

fn read_error(e: ReadError) -> Error {
    match e {
        ReadError::Io(e) => Error::transport(Stage::Receiver, e),
        ReadError::Protocol(e) => Error::Protocol(e),
    }
}

/// Wait for the peer to close after the last tracked frame.
///
/// Anything still arriving is a duplicated or stray tail. A peer that keeps
/// the connection open past [`CLOSE_GRACE`] without sending is accepted.
pub async fn expect_close<R>(reader: &mut R, grace: Duration) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 4096];
    let mut trailing = 0usize;

    loop {
        match tokio::time::timeout(grace, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => trailing += n,
            Ok(Err(e)) => return Err(Error::transport(Stage::Receiver, e)),
            Err(_) => {
                debug!(trailing, "Peer kept the connection open");
                break;
            }
        }
    }

    if trailing > 0 {
        return Err(ProtocolError::TrailingData { bytes: trailing }.into());
    }
    Ok(())
}

/// Read frames until the receive side is done, forwarding each to `out`.
///
/// Returns the payload bytes received.
pub async fn run<R>(
    mut reader: R,
    cond: TransferCondition,
    mut stash: StashReceiver,
    out: mpsc::Sender<Received>,
    cancel: CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut seqs = SeqTracker::new();
    let mut total = 0u64;

    loop {
        if let Some(target) = cond.total_size {
            if total >= target {
                debug!(total, target, "Transfer target reached");
                break;
            }
        }

        let entry = until_cancelled(&cancel, Stage::Receiver, total, stash.pop()).await?;
        let Some(entry) = entry else {
            until_cancelled(
                &cancel,
                Stage::Receiver,
                total,
                expect_close(&mut reader, CLOSE_GRACE),
            )
            .await??;
            break;
        };

        let frame = until_cancelled(
            &cancel,
            Stage::Receiver,
            total,
            read_frame(&mut reader, &mut seqs, entry.len),
        )
        .await??;
        let Some(frame) = frame else {
            info!(total, "Connection closed by peer");
            break;
        };

        let len = frame.chunk.len();
        total += len as u64;

        if cond.verbose {
            trace!(seq = frame.header.seq, len, "Received");
        }

        let received = Received {
            entry,
            seq: frame.header.seq,
            chunk: frame.chunk,
            received_at: Instant::now(),
        };
        until_cancelled(&cancel, Stage::Receiver, total, out.send(received))
            .await?
            .map_err(|_| Error::Cancelled {
                stage: Stage::Receiver,
                total,
            })?;
    }

    debug!(total, frames = seqs.expected() - 1, "Receiver finished");
    Ok(total)
}
