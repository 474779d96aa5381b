//! Connection plumbing shared by every stage.
//!
//! Provides the write and read loops that tolerate partial I/O, plus dialing
//! the destination with configurable socket options.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::ProtocolError;

/// Outcome of reading one fixed-size unit from the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The whole buffer was filled.
    Complete,
    /// The peer closed before any byte of this unit arrived.
    Closed,
}

/// Error from [`read_full`].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Write the whole buffer, accumulating partial writes.
///
/// A short write is not an error; a zero-length write is reported as
/// `WriteZero` since the transport can no longer make progress.
pub async fn write_full<W>(writer: &mut W, buf: &[u8], verbose: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut sent = 0;
    while sent < buf.len() {
        let n = writer.write(&buf[sent..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("connection accepted {sent} of {} bytes", buf.len()),
            ));
        }

        if verbose {
            trace!(bytes = n, "Sent");
        }

        sent += n;
    }
    Ok(())
}

/// Read until `buf` is full or the source is exhausted.
///
/// Returns the number of bytes filled. Anything short of `buf.len()` means
/// end of stream was reached.
pub async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read exactly `buf.len()` bytes from the connection.
///
/// End of stream before the first byte is a clean close. End of stream after
/// some bytes arrived is a truncated unit.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, ReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let received = fill(reader, buf).await?;
    if received == buf.len() {
        Ok(ReadOutcome::Complete)
    } else if received == 0 {
        debug!("Connection closed");
        Ok(ReadOutcome::Closed)
    } else {
        Err(ReadError::Protocol(ProtocolError::Truncated {
            expected: buf.len(),
            received,
        }))
    }
}

/// Dial the configured destination.
///
/// Every resolved address is tried in order; the last failure is returned
/// when none accepts.
pub async fn connect(config: &Config) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(config.addr.as_str()).await? {
        match connect_addr(addr, config).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {}", config.addr),
        )
    }))
}

async fn connect_addr(addr: SocketAddr, config: &Config) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_nodelay(config.nodelay)?;
    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;

    let std_stream: std::net::TcpStream = socket.into();
    let socket = TcpSocket::from_std_stream(std_stream);
    socket.connect(addr).await
}
