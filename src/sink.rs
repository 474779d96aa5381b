//! Final consumer of verified chunks.

use std::io;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::chunk::Chunk;
use crate::connection::write_full;

/// Where verified chunks end up: counted and dropped, or appended to a writer.
pub struct Sink {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    verbose: bool,
}

impl Sink {
    /// Count-only sink.
    pub fn discard() -> Self {
        Self {
            writer: None,
            verbose: false,
        }
    }

    /// Append to an arbitrary writer.
    pub fn writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Some(Box::new(writer)),
            verbose: false,
        }
    }

    /// Create (or truncate) `path` and append to it.
    pub async fn file(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::writer(file))
    }

    /// Log every partial write at trace level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn is_discard(&self) -> bool {
        self.writer.is_none()
    }

    /// Consume one chunk.
    pub async fn consume(&mut self, chunk: &Chunk) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => write_full(writer.as_mut(), chunk.as_bytes(), self.verbose).await,
            None => Ok(()),
        }
    }

    /// Flush anything buffered by the writer.
    pub async fn finish(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }

    /// In-memory sink for tests; returns the shared buffer it appends to.
    #[cfg(test)]
    pub fn memory() -> (Self, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        (Self::writer(SharedBuf(buf.clone())), buf)
    }
}

#[cfg(test)]
struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        let mut inner = self.0.lock().expect("sink buffer poisoned");
        inner.extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_discard() {
        let mut sink = Sink::discard();
        assert!(sink.is_discard());
        sink.consume(&Chunk::new(vec![1u8; 64])).await.unwrap();
        sink.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_writes() {
        let mock = Builder::new().write(b"he").write(b"llo").build();
        let mut sink = Sink::writer(mock);
        sink.consume(&Chunk::new(&b"hello"[..])).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_sink_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = Sink::file(&path).await.unwrap();
        sink.consume(&Chunk::new(&b"abc"[..])).await.unwrap();
        sink.consume(&Chunk::new(&b"def"[..])).await.unwrap();
        sink.finish().await.unwrap();
        drop(sink);

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }
}
