//! Yamux stream-multiplexer adapter.
//!
//! A secure connection is handed to the `yamux` crate; the outbound side of
//! the connection acts as yamux client, the inbound side as yamux server.
//! The yamux session is owned by a dedicated driver task that pumps its
//! I/O and is commanded over a channel: stream opens arrive with a oneshot
//! reply, inbound substreams are forwarded out, and close drains the
//! session.

use crate::error::{NetworkError, NetworkResult};
use crate::noise::SecureStream;
use futures::future::poll_fn;
use quay_core::Direction;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace};

/// Protocol identifier proposed for this muxer.
pub const PROTOCOL_ID: &str = "/yamux/1.0.0";

enum Command {
    OpenStream(oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>),
    Close(oneshot::Sender<()>),
}

/// A connection upgraded to carry multiple independent substreams.
pub struct MuxedConn {
    commands: mpsc::Sender<Command>,
    inbound: Mutex<mpsc::UnboundedReceiver<yamux::Stream>>,
    closed: Arc<AtomicBool>,
}

/// Layer a yamux session over a secure connection.
///
/// `Outbound` runs the session in client mode, `Inbound` in server mode.
pub fn multiplex<S>(secure: SecureStream<S>, direction: Direction) -> MuxedConn
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mode = match direction {
        Direction::Outbound => yamux::Mode::Client,
        Direction::Inbound => yamux::Mode::Server,
    };
    let connection = yamux::Connection::new(secure.compat(), yamux::Config::default(), mode);

    let (command_tx, command_rx) = mpsc::channel(16);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    tokio::spawn(drive(connection, command_rx, inbound_tx, closed.clone()));

    MuxedConn {
        commands: command_tx,
        inbound: Mutex::new(inbound_rx),
        closed,
    }
}

/// Pump the yamux session: serve open requests, forward inbound substreams,
/// and close on demand. The session's socket I/O only makes progress while
/// this task polls it.
async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::UnboundedSender<yamux::Stream>,
    closed: Arc<AtomicBool>,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut pending_opens: VecDeque<oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>> =
        VecDeque::new();
    let mut close_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut closing = false;

    let result: Option<yamux::ConnectionError> = poll_fn(|cx| {
        loop {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::OpenStream(reply))) => pending_opens.push_back(reply),
                Poll::Ready(Some(Command::Close(reply))) => {
                    close_waiters.push(reply);
                    closing = true;
                }
                // All handles dropped: tear the session down.
                Poll::Ready(None) => {
                    closing = true;
                    break;
                }
                Poll::Pending => break,
            }
        }

        if closing {
            return match connection.poll_close(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(None),
                Poll::Ready(Err(e)) => Poll::Ready(Some(e)),
                Poll::Pending => Poll::Pending,
            };
        }

        while !pending_opens.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(reply) = pending_opens.pop_front() {
                        let _ = reply.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Some(e)),
                Poll::Pending => break,
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    trace!("inbound substream accepted");
                    // Receiver gone means nobody accepts; keep pumping so
                    // the session stays usable for outbound streams.
                    let _ = inbound.send(stream);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(e)),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    closed.store(true, Ordering::SeqCst);
    if let Some(e) = &result {
        debug!(error = %e, "yamux session ended");
    }
    for reply in pending_opens {
        let _ = reply.send(Err(yamux::ConnectionError::Closed));
    }
    for reply in close_waiters {
        let _ = reply.send(());
    }
}

impl MuxedConn {
    /// Open a new substream.
    pub async fn open_stream(&self) -> NetworkResult<MuxStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::OpenStream(reply_tx))
            .await
            .map_err(|_| NetworkError::ConnectionClosed)?;
        let stream = reply_rx
            .await
            .map_err(|_| NetworkError::ConnectionClosed)??;
        Ok(MuxStream::new(stream))
    }

    /// Wait for a substream opened by the remote.
    pub async fn accept_stream(&self) -> NetworkResult<MuxStream> {
        let mut inbound = self.inbound.lock().await;
        inbound
            .recv()
            .await
            .map(MuxStream::new)
            .ok_or(NetworkError::ConnectionClosed)
    }

    /// Close the session, draining in-flight streams. Idempotent.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close(reply_tx))
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Whether the session is fully closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A single bidirectional substream of a muxed connection.
pub struct MuxStream {
    /// `None` after a reset or full close; the yamux session garbage
    /// collects a dropped, unclosed substream by resetting it.
    inner: Option<Compat<yamux::Stream>>,
}

impl MuxStream {
    fn new(stream: yamux::Stream) -> MuxStream {
        MuxStream {
            inner: Some(stream.compat()),
        }
    }

    fn gone() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, NetworkError::StreamReset.to_string())
    }

    /// Close the write half, flushing buffered data and sending EOF.
    /// Reading is still allowed afterwards.
    pub async fn close_write(&mut self) -> NetworkResult<()> {
        match self.inner.as_mut() {
            Some(stream) => Ok(stream.shutdown().await?),
            None => Err(NetworkError::StreamReset),
        }
    }

    /// Close both ends and release the substream.
    pub async fn close(&mut self) -> NetworkResult<()> {
        match self.inner.as_mut() {
            Some(stream) => {
                stream.shutdown().await?;
                self.inner = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Abort the substream, signaling an error to the remote.
    pub fn reset(&mut self) {
        self.inner = None;
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(MuxStream::gone())),
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(MuxStream::gone())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(MuxStream::gone())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
