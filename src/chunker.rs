//! Chunk producers.
//!
//! Two sources feed the pipeline:
//! - a readable byte source (usually a file) cut into fixed-size chunks
//! - a synthetic generator producing `nominal +/- variation` sized chunks of
//!   random bytes until a wall-clock or size budget runs out
//!
//! Both push chunks onto the output queue in order and seal it by dropping
//! the sender when done.

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::config::TransferCondition;
use crate::connection::fill;
use crate::error::{Error, Result, Stage};
use crate::pipeline::until_cancelled;

/// Where chunks come from.
pub enum Source {
    /// Sequential reads of `buf_size` bytes until the reader is exhausted.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// Random chunks until the budget is spent.
    Synthetic { generator: Generator, budget: Budget },
}

impl Source {
    /// Produce every chunk onto `out`, returning the total bytes produced.
    pub async fn run(
        self,
        cond: TransferCondition,
        out: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        match self {
            Source::Reader(reader) => read_chunks(reader, cond, out, cancel).await,
            Source::Synthetic { generator, budget } => {
                generate_chunks(generator, budget, cond, out, cancel).await
            }
        }
    }
}

/// Cut `reader` into chunks of `cond.buf_size` bytes.
///
/// Each chunk is filled completely before it is emitted, so only the final
/// chunk may be shorter. A read that returns nothing ends the sequence.
pub async fn read_chunks<R>(
    mut reader: R,
    cond: TransferCondition,
    out: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;

    loop {
        let mut buf = BytesMut::zeroed(cond.buf_size);
        let n = until_cancelled(&cancel, Stage::Chunker, total, fill(&mut reader, &mut buf[..]))
            .await?
            .map_err(|e| Error::transport(Stage::Chunker, e))?;
        if n == 0 {
            break;
        }
        buf.truncate(n);

        if cond.verbose {
            trace!(len = n, "Read");
        }

        push(&out, Chunk::new(buf.freeze()), total, &cancel).await?;
        total += n as u64;

        if n < cond.buf_size {
            break;
        }
    }

    debug!(total, "Reader exhausted");
    Ok(total)
}

/// Generate random chunks until `budget` is spent.
pub async fn generate_chunks(
    mut generator: Generator,
    budget: Budget,
    cond: TransferCondition,
    out: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) -> Result<u64> {
    let start = Instant::now();
    let mut total = 0u64;

    while let Some(remaining) = budget.remaining(start.elapsed(), total) {
        let chunk = generator.next_chunk(remaining);
        let len = chunk.len() as u64;

        if cond.verbose {
            trace!(len, "Generated");
        }

        push(&out, chunk, total, &cancel).await?;
        total += len;
    }

    debug!(total, elapsed = ?start.elapsed(), "Generation budget spent");
    Ok(total)
}

async fn push(
    out: &mpsc::Sender<Chunk>,
    chunk: Chunk,
    total: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    until_cancelled(cancel, Stage::Chunker, total, out.send(chunk))
        .await?
        .map_err(|_| Error::Cancelled {
            stage: Stage::Chunker,
            total,
        })
}

/// Random chunk generator.
pub struct Generator {
    rng: StdRng,
    nominal: usize,
    variation: usize,
}

impl Generator {
    pub fn new(nominal: usize, variation: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            nominal,
            variation,
        }
    }

    /// Generator sized by the run's chunk size and variation.
    pub fn from_condition(cond: &TransferCondition, seed: Option<u64>) -> Self {
        Self::new(cond.buf_size, cond.buf_size_var, seed)
    }

    /// Next chunk length: uniform in `[nominal - variation, nominal + variation]`,
    /// never below one byte.
    pub fn next_len(&mut self) -> usize {
        let spread = self.rng.gen_range(0..=self.variation * 2);
        (self.nominal + spread).saturating_sub(self.variation).max(1)
    }

    /// Next chunk of random bytes, at most `limit` long.
    pub fn next_chunk(&mut self, limit: u64) -> Chunk {
        let len = (self.next_len() as u64).min(limit) as usize;
        let mut buf = BytesMut::zeroed(len);
        self.rng.fill_bytes(&mut buf[..]);
        Chunk::new(buf.freeze())
    }
}

/// Limits on synthetic generation; whichever runs out first ends it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub duration: Option<Duration>,
    pub total: Option<u64>,
}

impl Budget {
    /// Bytes that may still be produced, or `None` once the budget is spent.
    pub fn remaining(&self, elapsed: Duration, produced: u64) -> Option<u64> {
        if let Some(duration) = self.duration {
            if elapsed >= duration {
                return None;
            }
        }
        match self.total {
            Some(total) if produced >= total => None,
            Some(total) => Some(total - produced),
            None => Some(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn condition(buf_size: usize) -> TransferCondition {
        let mut config = Config::default();
        config.buf_size = buf_size;
        config.condition(None)
    }

    async fn collect(mut rx: mpsc::Receiver<Chunk>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_file_chunks_with_trailing_partial() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(collect(rx));

        let total = read_chunks(&data[..], condition(256), tx, CancellationToken::new())
            .await
            .unwrap();
        let chunks = collector.await.unwrap();

        assert_eq!(total, 1000);
        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![256, 256, 256, 232]);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.as_bytes().to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_file_chunks_exact_multiple() {
        let data = vec![7u8; 512];
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(collect(rx));

        let total = read_chunks(&data[..], condition(256), tx, CancellationToken::new())
            .await
            .unwrap();
        let sizes: Vec<usize> = collector.await.unwrap().iter().map(Chunk::len).collect();

        assert_eq!(total, 512);
        assert_eq!(sizes, vec![256, 256]);
    }

    #[tokio::test]
    async fn test_file_chunks_short_reads_are_filled() {
        let mock = tokio_test::io::Builder::new()
            .read(b"abc")
            .read(b"de")
            .read(b"fgh")
            .build();
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(collect(rx));

        let total = read_chunks(mock, condition(4), tx, CancellationToken::new())
            .await
            .unwrap();
        let chunks = collector.await.unwrap();

        assert_eq!(total, 8);
        assert_eq!(chunks[0].as_bytes(), b"abcd");
        assert_eq!(chunks[1].as_bytes(), b"efgh");
    }

    #[tokio::test]
    async fn test_read_failure_is_fatal() {
        let mock = tokio_test::io::Builder::new()
            .read(b"abcd")
            .read_error(std::io::Error::new(std::io::ErrorKind::Other, "disk"))
            .build();
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(collect(rx));

        let err = read_chunks(mock, condition(4), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport {
                stage: Stage::Chunker,
                ..
            }
        ));
        assert_eq!(collector.await.unwrap().len(), 1);
    }

    #[test]
    fn test_generator_lengths_within_spread() {
        let mut generator = Generator::new(300, 100, Some(42));
        for _ in 0..1000 {
            let len = generator.next_len();
            assert!((200..=400).contains(&len), "len {len} out of range");
        }
    }

    #[test]
    fn test_generator_from_condition() {
        let mut config = Config::default();
        config.buf_size = 64;
        config.buf_size_var = 8;
        let mut generator = Generator::from_condition(&config.condition(None), Some(3));
        for _ in 0..1000 {
            let len = generator.next_len();
            assert!((56..=72).contains(&len), "len {len} out of range");
        }
    }

    #[test]
    fn test_generator_seed_is_reproducible() {
        let mut a = Generator::new(64, 16, Some(7));
        let mut b = Generator::new(64, 16, Some(7));
        for _ in 0..10 {
            assert_eq!(a.next_chunk(u64::MAX), b.next_chunk(u64::MAX));
        }
    }

    #[test]
    fn test_generator_respects_limit() {
        let mut generator = Generator::new(300, 0, Some(1));
        assert_eq!(generator.next_chunk(10).len(), 10);
        assert_eq!(generator.next_chunk(1000).len(), 300);
    }

    #[test]
    fn test_budget() {
        let budget = Budget {
            duration: Some(Duration::from_secs(1)),
            total: None,
        };
        assert_eq!(budget.remaining(Duration::ZERO, 0), Some(u64::MAX));
        assert_eq!(budget.remaining(Duration::from_secs(1), 0), None);

        let budget = Budget {
            duration: None,
            total: Some(1000),
        };
        assert_eq!(budget.remaining(Duration::from_secs(60), 400), Some(600));
        assert_eq!(budget.remaining(Duration::ZERO, 1000), None);
    }

    #[tokio::test]
    async fn test_generate_exact_size_budget() {
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(collect(rx));
        let budget = Budget {
            duration: None,
            total: Some(10_000),
        };

        let total = generate_chunks(
            Generator::new(300, 100, Some(3)),
            budget,
            condition(300),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let chunks = collector.await.unwrap();

        assert_eq!(total, 10_000);
        assert_eq!(chunks.iter().map(|c| c.len() as u64).sum::<u64>(), 10_000);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[tokio::test]
    async fn test_generate_stops_when_consumer_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = generate_chunks(
            Generator::new(16, 0, Some(3)),
            Budget::default(),
            condition(16),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
