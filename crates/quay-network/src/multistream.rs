//! Multistream-select: a length-prefixed line protocol that negotiates one
//! protocol identifier from a proposer's preference list against a
//! responder's registered set.
//!
//! Each frame is `varint-length | utf8 | '\n'`. Both sides open with the
//! header `/multistream/1.0.0`; the proposer then sends candidates in order
//! and the responder echoes an accepted identifier or replies `na`.
//!
//! The same implementation runs at three sites: security selection on the
//! raw connection, muxer selection on the secure connection, and per-stream
//! protocol selection on each new substream. Nothing here knows which site
//! it is serving; it is parameterized by the byte stream alone.

use crate::error::{NetworkError, NetworkResult};
use crate::stream::Stream;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use quay_core::ProtocolId;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header string both sides exchange before negotiating.
pub const PROTOCOL_HEADER: &str = "/multistream/1.0.0";

/// Rejection literal.
const NA: &str = "na";

/// Listing request literal.
const LS: &str = "ls";

/// Negotiation frames have no business being larger than this.
const MAX_FRAME_LEN: usize = 1024;

/// Handler invoked for each inbound stream negotiated to its protocol.
pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

async fn write_frame<S>(io: &mut S, msg: &str) -> NetworkResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(msg.len() + 4);
    let mut len = msg.len() as u64 + 1; // trailing newline
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
    buf.extend_from_slice(msg.as_bytes());
    buf.push(b'\n');
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

async fn read_varint<S>(io: &mut S) -> NetworkResult<u64>
where
    S: AsyncRead + Unpin,
{
    let mut value = 0u64;
    for shift in 0..10 {
        let byte = io.read_u8().await?;
        value |= u64::from(byte & 0x7f) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(NetworkError::Protocol("frame length varint too long".into()))
}

async fn read_frame<S>(io: &mut S) -> NetworkResult<String>
where
    S: AsyncRead + Unpin,
{
    let len = read_varint(io).await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(NetworkError::Protocol(format!("bad frame length {len}")));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(NetworkError::Protocol("frame missing trailing newline".into()));
    }
    String::from_utf8(buf).map_err(|_| NetworkError::Protocol("frame is not utf-8".into()))
}

fn is_eof(err: &NetworkError) -> bool {
    matches!(err, NetworkError::Io(e) if e.kind() == ErrorKind::UnexpectedEof)
}

/// Propose each protocol in `protos` in order and return the first one the
/// responder accepts.
///
/// Exhausting the list surfaces [`NetworkError::NegotiationFailed`] carrying
/// every rejected identifier.
pub async fn select_one_of<S>(protos: &[ProtocolId], io: &mut S) -> NetworkResult<ProtocolId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(io, PROTOCOL_HEADER).await?;
    let header = read_frame(io).await?;
    if header != PROTOCOL_HEADER {
        return Err(NetworkError::Protocol(format!(
            "unexpected multistream header {header:?}"
        )));
    }

    for proto in protos {
        write_frame(io, proto).await?;
        match read_frame(io).await {
            Ok(reply) if reply == *proto => return Ok(proto.clone()),
            Ok(reply) if reply == NA => continue,
            Ok(reply) => {
                return Err(NetworkError::Protocol(format!(
                    "unexpected reply {reply:?} to proposal {proto:?}"
                )))
            }
            Err(e) if is_eof(&e) => {
                return Err(NetworkError::NegotiationFailed {
                    proposed: protos.to_vec(),
                })
            }
            Err(e) => return Err(e),
        }
    }
    Err(NetworkError::NegotiationFailed {
        proposed: protos.to_vec(),
    })
}

/// A thread-safe registry of protocols and their stream handlers, acting as
/// the responder half of multistream-select.
///
/// The registry is also used handler-less for the security and muxer
/// selection sites, where only the identifier set matters.
#[derive(Default)]
pub struct MultistreamMuxer {
    handlers: RwLock<HashMap<ProtocolId, Option<StreamHandler>>>,
}

impl MultistreamMuxer {
    pub fn new() -> MultistreamMuxer {
        MultistreamMuxer::default()
    }

    /// Register a protocol, optionally with a handler for inbound streams.
    ///
    /// `set_handler` and `remove_handler` are safe against concurrent
    /// negotiations.
    pub fn add_handler(&self, proto: ProtocolId, handler: Option<StreamHandler>) {
        self.handlers.write().insert(proto, handler);
    }

    pub fn remove_handler(&self, proto: &str) {
        self.handlers.write().remove(proto);
    }

    /// The registered identifiers, sorted for stable output.
    pub fn protocols(&self) -> Vec<ProtocolId> {
        let mut protos: Vec<ProtocolId> = self.handlers.read().keys().cloned().collect();
        protos.sort();
        protos
    }

    pub(crate) fn handler(&self, proto: &str) -> Option<StreamHandler> {
        self.handlers.read().get(proto).cloned().flatten()
    }

    /// Respond to proposals until one matches the registered set.
    ///
    /// An end-of-stream before any acceptance is reported as
    /// [`NetworkError::ProtocolsNotSupported`] naming the registered set,
    /// since it strongly indicates the dialer rejected all of it.
    pub async fn negotiate<S>(&self, io: &mut S) -> NetworkResult<ProtocolId>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let eof_diagnostic = |e: NetworkError| {
            if is_eof(&e) {
                NetworkError::ProtocolsNotSupported {
                    supported: self.protocols(),
                }
            } else {
                e
            }
        };

        write_frame(io, PROTOCOL_HEADER).await?;
        let header = read_frame(io).await.map_err(eof_diagnostic)?;
        if header != PROTOCOL_HEADER {
            return Err(NetworkError::Protocol(format!(
                "unexpected multistream header {header:?}"
            )));
        }

        loop {
            let proposal = read_frame(io).await.map_err(eof_diagnostic)?;
            if proposal == LS {
                write_frame(io, &self.protocols().join("\n")).await?;
                continue;
            }
            if self.handlers.read().contains_key(&proposal) {
                write_frame(io, &proposal).await?;
                return Ok(proposal);
            }
            write_frame(io, NA).await?;
        }
    }
}
