//! Negotiated streams.

use crate::connection::Connection;
use crate::error::{NetworkError, NetworkResult};
use crate::muxer::MuxStream;
use quay_core::{Direction, ProtocolId};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// A bidirectional substream negotiated to a protocol.
///
/// Holds a non-owning back-reference to its parent connection: a stream
/// never keeps a closed connection alive, and once the muxer session goes
/// away its operations fail with the stable stream-reset error.
pub struct Stream {
    inner: MuxStream,
    conn: Weak<Connection>,
    protocol: ProtocolId,
    direction: Direction,
    read_deadline: DeadlineState,
    write_deadline: DeadlineState,
}

/// An optional deadline plus its lazily armed timer.
#[derive(Default)]
struct DeadlineState {
    at: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl DeadlineState {
    fn set(&mut self, at: Option<Instant>) {
        self.at = at;
        self.timer = None;
    }

    /// Ready when the deadline has passed.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(at) = self.at else {
            return Poll::Pending;
        };
        let timer = self.timer.get_or_insert_with(|| Box::pin(sleep_until(at)));
        timer.as_mut().poll(cx)
    }

    fn disarm(&mut self) {
        self.timer = None;
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, NetworkError::Timeout.to_string())
}

impl Stream {
    pub(crate) fn new(
        inner: MuxStream,
        conn: Weak<Connection>,
        protocol: ProtocolId,
        direction: Direction,
    ) -> Stream {
        Stream {
            inner,
            conn,
            protocol,
            direction,
            read_deadline: DeadlineState::default(),
            write_deadline: DeadlineState::default(),
        }
    }

    /// The protocol negotiated on this stream.
    pub fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The connection this stream belongs to, if it is still registered.
    pub fn conn(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    /// Set both the read and write deadline.
    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
        self.write_deadline.set(at);
    }

    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    /// Close the write half, flushing buffered data and sending EOF. Reads
    /// stay usable; call `close` or `reset` to release the stream.
    pub async fn close_write(&mut self) -> NetworkResult<()> {
        self.inner.close_write().await
    }

    /// Close both ends and release the stream.
    pub async fn close(&mut self) -> NetworkResult<()> {
        self.inner.close().await
    }

    /// Abort the stream, signaling an error to the remote.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline.disarm();
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_deadline.poll_expired(cx).is_ready() {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline.disarm();
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::{multiplex, MuxedConn};
    use crate::noise::NoiseTransport;
    use quay_core::Keypair;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn muxed_pair() -> (MuxedConn, MuxedConn) {
        let dialer = NoiseTransport::new(Keypair::generate(), vec![]);
        let listener = NoiseTransport::new(Keypair::generate(), vec![]);
        let (client, server) = tokio::io::duplex(1 << 20);
        let (outbound, inbound) = tokio::join!(
            dialer.secure_outbound(client, None),
            listener.secure_inbound(server, None),
        );
        (
            multiplex(outbound.unwrap(), Direction::Outbound),
            multiplex(inbound.unwrap(), Direction::Inbound),
        )
    }

    fn wrap(inner: MuxStream, direction: Direction) -> Stream {
        Stream::new(inner, Weak::new(), "/test/1.0.0".to_string(), direction)
    }

    #[tokio::test]
    async fn test_read_deadline_expires() {
        let (client, server) = muxed_pair().await;
        let (opened, _accepted) = tokio::join!(
            async { client.open_stream().await.unwrap() },
            async { server.accept_stream().await.unwrap() },
        );

        let mut stream = wrap(opened, Direction::Outbound);
        stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

        // Nobody writes, so the read must time out.
        let mut buf = [0u8; 1];
        let err = stream.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_deadline_cleared_allows_io() {
        let (client, server) = muxed_pair().await;
        let (opened, accepted) = tokio::join!(
            async { client.open_stream().await.unwrap() },
            async { server.accept_stream().await.unwrap() },
        );

        let mut writer = wrap(opened, Direction::Outbound);
        let mut reader = wrap(accepted, Direction::Inbound);
        reader.set_read_deadline(Some(Instant::now() + Duration::from_secs(30)));
        reader.set_read_deadline(None);

        writer.write_all(b"x").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_stream_survives_while_conn_dropped_reference_is_gone() {
        let (client, server) = muxed_pair().await;
        let (opened, _accepted) = tokio::join!(
            async { client.open_stream().await.unwrap() },
            async { server.accept_stream().await.unwrap() },
        );

        let stream = wrap(opened, Direction::Outbound);
        // The back-reference is weak: no parent means no handle, not a leak.
        assert!(stream.conn().is_none());
        assert_eq!(stream.protocol(), "/test/1.0.0");
    }

    #[tokio::test]
    async fn test_reset_then_io_fails() {
        let (client, server) = muxed_pair().await;
        let (opened, _accepted) = tokio::join!(
            async { client.open_stream().await.unwrap() },
            async { server.accept_stream().await.unwrap() },
        );

        let mut stream = wrap(opened, Direction::Outbound);
        stream.reset();
        assert!(stream.write_all(b"nope").await.is_err());
    }
}
