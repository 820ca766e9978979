//! Byte-level transport over one stream socket.
//!
//! [`Transport`] owns the socket and tracks each direction separately so
//! the link can be half-closed: after [`Transport::shutdown_tx`] writes are
//! silently dropped while reads keep delivering whatever the peer still
//! sends.

use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::error::LinkError;

// ── Outcomes ─────────────────────────────────────────────────────

/// Result of one bounded-time read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were appended to the buffer.
    Data(usize),
    /// Nothing arrived within the read timeout; the peer may still be alive.
    TimedOut,
    /// The peer closed (or reset) the connection. Permanent.
    Closed,
}

/// Result of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All bytes were handed to the socket.
    Sent,
    /// The transmit side is closed; nothing was written.
    Dropped,
    /// The connection was reset during the write; the transmit side is now
    /// permanently closed.
    Reset,
}

// ── Transport ────────────────────────────────────────────────────

/// One connection, with independently closable directions.
#[derive(Debug)]
pub struct Transport<S = TcpStream> {
    io: Option<S>,
    tx_open: bool,
    rx_open: bool,
    read_timeout: Duration,
    read_chunk: usize,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, read_timeout: Duration, read_chunk: usize) -> Self {
        Self {
            io: Some(io),
            tx_open: true,
            rx_open: true,
            read_timeout,
            read_chunk: read_chunk.max(1),
        }
    }

    // ── State ────────────────────────────────────────────────────

    pub fn tx_open(&self) -> bool {
        self.tx_open && self.io.is_some()
    }

    pub fn rx_open(&self) -> bool {
        self.rx_open && self.io.is_some()
    }

    /// Both directions usable.
    pub fn is_open(&self) -> bool {
        self.tx_open() && self.rx_open()
    }

    /// The socket has been released.
    pub fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    // ── Receive side ─────────────────────────────────────────────

    /// Read at most one chunk into `buf`, giving up after the read timeout.
    pub async fn read(&mut self, buf: &mut BytesMut) -> Result<ReadOutcome, LinkError> {
        if !self.rx_open {
            return Ok(ReadOutcome::Closed);
        }
        let Some(io) = self.io.as_mut() else {
            return Ok(ReadOutcome::Closed);
        };

        buf.reserve(self.read_chunk);
        let mut limited = (&mut *io).take(self.read_chunk as u64);
        let result = tokio::time::timeout(self.read_timeout, limited.read_buf(buf)).await;

        match result {
            Err(_elapsed) => Ok(ReadOutcome::TimedOut),
            Ok(Ok(0)) => {
                self.rx_open = false;
                Ok(ReadOutcome::Closed)
            }
            Ok(Ok(n)) => Ok(ReadOutcome::Data(n)),
            Ok(Err(e)) if is_reset(&e) => {
                warn!("connection reset while reading: {e}");
                self.rx_open = false;
                Ok(ReadOutcome::Closed)
            }
            Ok(Err(e)) => {
                self.rx_open = false;
                Err(e.into())
            }
        }
    }

    /// Stop receiving. Data still in flight from the peer is ignored.
    pub fn close_rx(&mut self) {
        self.rx_open = false;
    }

    // ── Transmit side ────────────────────────────────────────────

    /// Write all of `bytes`, unless the transmit side is closed.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<WriteOutcome, LinkError> {
        if !self.tx_open {
            return Ok(WriteOutcome::Dropped);
        }
        let Some(io) = self.io.as_mut() else {
            return Ok(WriteOutcome::Dropped);
        };

        let result = match io.write_all(bytes).await {
            Ok(()) => io.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(WriteOutcome::Sent),
            Err(e) if is_reset(&e) => {
                warn!("connection reset: send failed: {e}");
                self.tx_open = false;
                Ok(WriteOutcome::Reset)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Half-close: stop sending, keep receiving. Returns `true` if the
    /// transmit side was open.
    pub async fn shutdown_tx(&mut self) -> bool {
        if !self.tx_open {
            return false;
        }
        self.tx_open = false;
        if let Some(io) = self.io.as_mut() {
            if let Err(e) = io.shutdown().await {
                warn!("error shutting down transmit side: {e}");
            }
        }
        true
    }

    /// Close both directions and release the socket. Returns `true` if the
    /// socket was still held.
    pub async fn close(&mut self) -> bool {
        self.shutdown_tx().await;
        self.close_rx();
        self.io.take().is_some()
    }
}

fn is_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(io: tokio::io::DuplexStream) -> Transport<tokio::io::DuplexStream> {
        Transport::new(io, Duration::from_millis(20), 8)
    }

    #[tokio::test]
    async fn read_reports_data_timeout_and_close() {
        let (ours, mut peer) = tokio::io::duplex(64);
        let mut t = transport(ours);
        let mut buf = BytesMut::new();

        assert_eq!(t.read(&mut buf).await.unwrap(), ReadOutcome::TimedOut);

        peer.write_all(b"<a/>").await.unwrap();
        assert_eq!(t.read(&mut buf).await.unwrap(), ReadOutcome::Data(4));
        assert_eq!(&buf[..], b"<a/>");

        drop(peer);
        assert_eq!(t.read(&mut buf).await.unwrap(), ReadOutcome::Closed);
        assert!(!t.rx_open());
        assert_eq!(&buf[..], b"<a/>");
    }

    #[tokio::test]
    async fn reads_are_bounded_by_chunk_size() {
        let (ours, mut peer) = tokio::io::duplex(64);
        let mut t = transport(ours);
        let mut buf = BytesMut::from(&b"xy"[..]);

        peer.write_all(b"0123456789abc").await.unwrap();
        assert_eq!(t.read(&mut buf).await.unwrap(), ReadOutcome::Data(8));
        assert_eq!(t.read(&mut buf).await.unwrap(), ReadOutcome::Data(5));
        assert_eq!(&buf[..], b"xy0123456789abc");
    }

    #[tokio::test]
    async fn writes_after_shutdown_are_dropped() {
        let (ours, mut peer) = tokio::io::duplex(64);
        let mut t = transport(ours);

        assert_eq!(t.write_all(b"<a/>").await.unwrap(), WriteOutcome::Sent);
        assert!(t.shutdown_tx().await);
        assert!(!t.shutdown_tx().await);
        assert_eq!(t.write_all(b"<b/>").await.unwrap(), WriteOutcome::Dropped);

        let mut seen = Vec::new();
        peer.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"<a/>");

        // Receive side still works after the half-close.
        peer.write_all(b"<c/>").await.unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(t.read(&mut buf).await.unwrap(), ReadOutcome::Data(4));
        assert!(t.rx_open());
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn close_releases_socket() {
        let (ours, _peer) = tokio::io::duplex(64);
        let mut t = transport(ours);
        assert!(t.close().await);
        assert!(t.is_closed());
        assert!(!t.close().await);
        let mut buf = BytesMut::new();
        assert_eq!(t.read(&mut buf).await.unwrap(), ReadOutcome::Closed);
    }
}
