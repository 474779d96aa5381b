//! Framer/sender stage.
//!
//! Takes chunks off its input queue in order, records each one in the stash
//! (when the receive side runs) and writes header plus payload to the
//! connection. Reports the payload bytes sent; headers are not counted.

use std::io;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::chunk::{Chunk, StashEntry};
use crate::config::TransferCondition;
use crate::connection::write_full;
use crate::error::{Error, Result, Stage};
use crate::pipeline::until_cancelled;
use crate::protocol::{FrameHeader, SeqCounter};
use crate::verifier::StashSender;

/// Write one frame: the 8-byte header followed by the full payload.
pub async fn write_frame<W>(
    writer: &mut W,
    header: &FrameHeader,
    payload: &[u8],
    verbose: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_full(writer, &header.encode(), verbose).await?;
    write_full(writer, payload, verbose).await
}

/// Send every chunk from `chunks` as a frame on `writer`.
///
/// The stash is sealed when this returns, which tells the receive side no
/// further frames are coming. The write side of the connection is shut down.
pub async fn run<W>(
    mut writer: W,
    cond: TransferCondition,
    mut chunks: mpsc::Receiver<Chunk>,
    mut stash: Option<StashSender>,
    cancel: CancellationToken,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut seqs = SeqCounter::new();
    let mut total = 0u64;

    loop {
        let chunk = until_cancelled(&cancel, Stage::Sender, total, chunks.recv()).await?;
        let Some(chunk) = chunk else {
            break;
        };

        let seq = seqs.next_seq();
        let header = FrameHeader::for_payload(chunk.len(), seq)?;

        let tracked = match &stash {
            Some(tx) => {
                let entry = StashEntry {
                    seq,
                    len: chunk.len(),
                    sent_at: Instant::now(),
                    payload: tx.mode().retains_payload().then(|| chunk.bytes()),
                };
                // A full stash blocks here until the receive side catches up.
                until_cancelled(&cancel, Stage::Sender, total, tx.push(entry))
                    .await?
                    .is_ok()
            }
            None => true,
        };
        if !tracked {
            warn!(seq, "Receive side finished early; remaining frames are untracked");
            stash = None;
        }

        until_cancelled(
            &cancel,
            Stage::Sender,
            total,
            write_frame(&mut writer, &header, chunk.as_bytes(), cond.verbose),
        )
        .await?
        .map_err(|e| Error::transport(Stage::Sender, e))?;

        total += chunk.len() as u64;

        if cond.verbose {
            trace!(seq, len = chunk.len(), "Frame sent");
        }
    }

    // Half-close so the peer sees end of stream once it has echoed everything.
    until_cancelled(&cancel, Stage::Sender, total, writer.shutdown())
        .await?
        .map_err(|e| Error::transport(Stage::Sender, e))?;

    debug!(total, frames = seqs.next_seq() - 1, "Sender finished");
    Ok(total)
}
