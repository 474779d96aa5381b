//! Pipeline coordinator.
//!
//! Wires the stages together with bounded queues, runs them concurrently
//! and cross-checks their totals once all of them have finished.
//!
//! ```text
//! chunker -> [chunks] -> sender -> socket -> receiver -> [received] -> verifier -> sink
//!                           \________ [stash] ________/
//! ```
//!
//! The first stage to fail cancels its siblings. Every stage is still joined
//! so the partial totals of the others end up in the diagnostics.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{Budget, Generator, Source};
use crate::config::{Config, TransferCondition};
use crate::connection;
use crate::error::{Error, Result, Stage};
use crate::receiver;
use crate::sender;
use crate::sink::Sink;
use crate::verifier::{self, LatencyStats, Totals, VerifyMode, VerifyReport};

/// Run `fut` unless `cancel` fires first.
///
/// `total` is the stage's running total at the time of the call, kept in the
/// cancellation error for diagnostics.
pub(crate) async fn until_cancelled<F>(
    cancel: &CancellationToken,
    stage: Stage,
    total: u64,
    fut: F,
) -> Result<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled { stage, total }),
        output = fut => Ok(output),
    }
}

/// Stage layout and queue sizing for one run.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub channel_size: usize,
    pub verify: VerifyMode,
}

impl From<&Config> for Options {
    fn from(config: &Config) -> Self {
        Self {
            channel_size: config.channel_size,
            verify: config.verify,
        }
    }
}

/// Aggregate result of a successful run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub totals: Totals,
    pub frames: u64,
    pub latency: Option<LatencyStats>,
    pub elapsed: Duration,
}

/// Receive side of the pipeline: the connection's read half and the sink.
pub struct ReceiveSide<R> {
    pub reader: R,
    pub sink: Sink,
}

/// Dial the destination, open files and run the pipeline selected by `config`.
pub async fn run(config: &Config) -> Result<Report> {
    let (input, total_size) = match &config.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| Error::transport(Stage::Chunker, e))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| Error::transport(Stage::Chunker, e))?
                .len();
            info!(path = %path.display(), bytes = len, "Reading chunks from file");
            (Some(file), Some(len))
        }
        // A size target is only a promise when no clock can cut it short.
        None => (None, config.total_size.filter(|_| config.duration.is_none())),
    };
    let cond = config.condition(total_size);

    let source = match input {
        Some(file) => Source::Reader(Box::new(file)),
        None => Source::Synthetic {
            generator: Generator::from_condition(&cond, config.seed),
            budget: Budget {
                duration: config.duration,
                total: config.total_size,
            },
        },
    };

    info!(addr = %config.addr, "Connect");
    let stream = connection::connect(config)
        .await
        .map_err(|e| Error::transport(Stage::Sender, e))?;
    if let Ok(peer) = stream.peer_addr() {
        info!(peer = %peer, "Connected");
    }

    // Created after the dial: a failed connect must not truncate an existing file.
    let sink = if config.receives() {
        match &config.output {
            Some(path) => Some(
                Sink::file(path)
                    .await
                    .map_err(|e| Error::transport(Stage::Verifier, e))?
                    .verbose(config.verbose),
            ),
            None => Some(Sink::discard()),
        }
    } else {
        None
    };
    if let Some(sink) = &sink {
        debug!(discard = sink.is_discard(), "Receive side enabled");
    }

    let (reader, writer) = stream.into_split();
    let receive = sink.map(|sink| ReceiveSide { reader, sink });

    run_with(source, writer, receive, cond, Options::from(config)).await
}

/// Run the pipeline over an already-open connection.
///
/// Without a receive side the run is send-only and only read and send totals
/// are compared.
pub async fn run_with<R, W>(
    source: Source,
    writer: W,
    receive: Option<ReceiveSide<R>>,
    cond: TransferCondition,
    options: Options,
) -> Result<Report>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let started = std::time::Instant::now();
    let cancel = CancellationToken::new();

    let (chunk_tx, chunk_rx) = mpsc::channel(options.channel_size);

    let chunker = spawn_stage(
        Stage::Chunker,
        &cancel,
        source.run(cond, chunk_tx, cancel.clone()),
    );

    let (stash_tx, receive_tasks) = match receive {
        Some(ReceiveSide { reader, sink }) => {
            let (stash_tx, stash_rx) = verifier::stash(options.channel_size, options.verify);
            let (received_tx, received_rx) = mpsc::channel(options.channel_size);

            let receiver = spawn_stage(
                Stage::Receiver,
                &cancel,
                receiver::run(reader, cond, stash_rx, received_tx, cancel.clone()),
            );
            let verifier = spawn_stage(
                Stage::Verifier,
                &cancel,
                verifier::run(cond, received_rx, sink, cancel.clone()),
            );
            (Some(stash_tx), Some((receiver, verifier)))
        }
        None => (None, None),
    };

    let sender = spawn_stage(
        Stage::Sender,
        &cancel,
        sender::run(writer, cond, chunk_rx, stash_tx, cancel.clone()),
    );

    let read = join_stage(Stage::Chunker, chunker).await;
    let sent = join_stage(Stage::Sender, sender).await;
    let (received, verified) = match receive_tasks {
        Some((receiver, verifier)) => (
            Some(join_stage(Stage::Receiver, receiver).await),
            Some(join_stage(Stage::Verifier, verifier).await),
        ),
        None => (None, None),
    };

    let outcomes = Outcomes {
        read,
        sent,
        received,
        verified,
    };
    let report = outcomes.into_report(started.elapsed())?;

    info!(
        read = report.totals.read,
        sent = report.totals.sent,
        received = ?report.totals.received,
        written = ?report.totals.written,
        frames = report.frames,
        elapsed = ?report.elapsed,
        "Transfer verified"
    );
    Ok(report)
}

/// Spawn a stage; its first real failure cancels every sibling.
fn spawn_stage<F, T>(stage: Stage, cancel: &CancellationToken, fut: F) -> JoinHandle<Result<T>>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let result = fut.await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                debug!(stage = %stage, error = %e, "Stage failed, cancelling siblings");
                cancel.cancel();
            }
        }
        result
    })
}

async fn join_stage<T>(stage: Stage, handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(Error::Join {
            stage,
            reason: e.to_string(),
        }),
    }
}

/// Per-stage results collected after every stage has been joined.
struct Outcomes {
    read: Result<u64>,
    sent: Result<u64>,
    received: Option<Result<u64>>,
    verified: Option<Result<VerifyReport>>,
}

impl Outcomes {
    fn has_failure(&self) -> bool {
        self.read.is_err()
            || self.sent.is_err()
            || matches!(self.received, Some(Err(_)))
            || matches!(self.verified, Some(Err(_)))
    }

    /// Pick the root failure, or check the totals when every stage succeeded.
    fn into_report(self, elapsed: Duration) -> Result<Report> {
        if self.has_failure() {
            self.log_partial();
        }

        let Outcomes {
            read,
            sent,
            received,
            verified,
        } = self;

        match (read, sent, received.transpose(), verified.transpose()) {
            (Ok(read), Ok(sent), Ok(received), Ok(verified)) => {
                let totals = Totals {
                    read,
                    sent,
                    received,
                    written: verified.map(|v| v.written),
                };
                totals.check()?;

                Ok(Report {
                    totals,
                    frames: verified.map(|v| v.frames).unwrap_or_default(),
                    latency: verified.map(|v| v.latency),
                    elapsed,
                })
            }
            (read, sent, received, verified) => {
                // Cancellations are only echoes of the root cause.
                let mut errors: Vec<Error> = [read.err(), sent.err(), received.err(), verified.err()]
                    .into_iter()
                    .flatten()
                    .collect();
                let root = errors
                    .iter()
                    .position(|e| !e.is_cancelled())
                    .unwrap_or(0);
                Err(errors.swap_remove(root))
            }
        }
    }

    fn log_partial(&self) {
        fn describe<T>(result: &Result<T>, total: impl Fn(&T) -> u64) -> String {
            match result {
                Ok(value) => total(value).to_string(),
                Err(Error::Cancelled { total, .. }) => format!("{total} (cancelled)"),
                Err(e) => format!("failed: {e}"),
            }
        }

        warn!(
            read = %describe(&self.read, |t| *t),
            sent = %describe(&self.sent, |t| *t),
            received = ?self.received.as_ref().map(|r| describe(r, |t| *t)),
            written = ?self.verified.as_ref().map(|r| describe(r, |v| v.written)),
            "Transfer aborted"
        );
    }
}
