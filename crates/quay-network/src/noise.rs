//! Noise security upgrade.
//!
//! Wraps a raw reliable byte stream into an authenticated, encrypted one.
//! The handshake follows the XX pattern over `Noise_XX_25519_ChaChaPoly_
//! SHA256`; a fresh static noise key is generated per connection and bound
//! to the long-term secp256k1 identity by a signature carried in the
//! handshake payload. The payload also carries each side's stream-muxer
//! preference list as early data, which the upgrade pipeline may use to
//! shortcut muxer selection.
//!
//! Wire format, both during and after the handshake: `u16 big-endian length
//! | ciphertext`.

use crate::error::{NetworkError, NetworkResult};
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream as _, StreamExt};
use prost::Message;
use quay_core::{Direction, Keypair, PeerId, ProtocolId, PublicKey};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

/// Protocol identifier proposed for this security protocol.
pub const PROTOCOL_ID: &str = "/noise";

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Domain separator for the identity signature over the static noise key.
const STATIC_KEY_DOMAIN: &[u8] = b"noise-libp2p-static-key:";

/// Maximum noise message size, including the 16-byte AEAD tag.
const MAX_FRAME_LEN: usize = 65535;

/// Largest plaintext that fits a single noise message.
const MAX_WRITE_LEN: usize = MAX_FRAME_LEN - 16;

/// Early-data muxer lists beyond this length are discarded outright.
const MAX_EARLY_MUXERS: usize = 100;

#[derive(Clone, PartialEq, Message)]
struct NoiseExtensions {
    #[prost(string, repeated, tag = "2")]
    stream_muxers: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
struct NoiseHandshakePayload {
    #[prost(bytes = "vec", tag = "1")]
    identity_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    identity_sig: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    extensions: Option<NoiseExtensions>,
}

/// The noise side of the upgrade pipeline: holds the local identity and
/// produces [`SecureStream`]s from raw connections.
pub struct NoiseTransport {
    local_id: PeerId,
    identity: Keypair,
    muxers: Vec<ProtocolId>,
}

impl NoiseTransport {
    /// Create a transport from the local identity key and the stream-muxer
    /// preference list advertised as handshake early data.
    pub fn new(identity: Keypair, muxers: Vec<ProtocolId>) -> NoiseTransport {
        let local_id = PeerId::from_public_key(identity.public());
        NoiseTransport {
            local_id,
            identity,
            muxers,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_id
    }

    /// Run the handshake as the initiator.
    ///
    /// The responder's identity must match `expected` when one is supplied.
    pub async fn secure_outbound<S>(
        &self,
        io: S,
        expected: Option<&PeerId>,
    ) -> NetworkResult<SecureStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.handshake(io, expected, true).await
    }

    /// Run the handshake as the responder.
    ///
    /// With `expected` empty, connections from any peer are accepted.
    pub async fn secure_inbound<S>(
        &self,
        io: S,
        expected: Option<&PeerId>,
    ) -> NetworkResult<SecureStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.handshake(io, expected, false).await
    }

    async fn handshake<S>(
        &self,
        io: S,
        expected: Option<&PeerId>,
        initiator: bool,
    ) -> NetworkResult<SecureStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let params = NOISE_PARAMS.parse().expect("noise params are well-formed");
        let builder = snow::Builder::new(params);
        let static_key = builder.generate_keypair()?;

        let payload = self.handshake_payload(&static_key.public);
        let builder =
            snow::Builder::new(NOISE_PARAMS.parse().expect("noise params are well-formed"))
                .local_private_key(&static_key.private);
        let mut state = if initiator {
            builder.build_initiator()?
        } else {
            builder.build_responder()?
        };

        let mut framed = Framed::new(
            io,
            LengthDelimitedCodec::builder()
                .length_field_length(2)
                .new_codec(),
        );
        let mut msg_buf = vec![0u8; MAX_FRAME_LEN];
        let mut payload_buf = vec![0u8; MAX_FRAME_LEN];

        let remote = if initiator {
            // -> e
            let n = state.write_message(&[], &mut msg_buf)?;
            send_frame(&mut framed, &msg_buf[..n]).await?;
            // <- e, ee, s, es (+ responder payload)
            let frame = recv_frame(&mut framed).await?;
            let n = state.read_message(&frame, &mut payload_buf)?;
            let remote = self.verify_payload(&payload_buf[..n], &state)?;
            // -> s, se (+ initiator payload)
            let n = state.write_message(&payload, &mut msg_buf)?;
            send_frame(&mut framed, &msg_buf[..n]).await?;
            remote
        } else {
            // <- e
            let frame = recv_frame(&mut framed).await?;
            state.read_message(&frame, &mut payload_buf)?;
            // -> e, ee, s, es (+ responder payload)
            let n = state.write_message(&payload, &mut msg_buf)?;
            send_frame(&mut framed, &msg_buf[..n]).await?;
            // <- s, se (+ initiator payload)
            let frame = recv_frame(&mut framed).await?;
            let n = state.read_message(&frame, &mut payload_buf)?;
            self.verify_payload(&payload_buf[..n], &state)?
        };

        if let Some(expected) = expected {
            if *expected != remote.peer {
                return Err(NetworkError::PeerIdMismatch {
                    expected: expected.clone(),
                    actual: remote.peer,
                });
            }
        }

        debug!(
            local = %self.local_id,
            remote = %remote.peer,
            initiator,
            "noise handshake complete"
        );

        Ok(SecureStream {
            framed,
            transport: state.into_transport_mode()?,
            local_peer: self.local_id.clone(),
            remote_peer: remote.peer,
            remote_public_key: remote.public_key,
            local_muxers: self.muxers.clone(),
            remote_muxers: remote.muxers,
            read_buffer: BytesMut::new(),
            plaintext_buf: vec![0u8; MAX_FRAME_LEN],
        })
    }

    fn handshake_payload(&self, static_noise_key: &[u8]) -> Vec<u8> {
        let mut to_sign = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + static_noise_key.len());
        to_sign.extend_from_slice(STATIC_KEY_DOMAIN);
        to_sign.extend_from_slice(static_noise_key);

        let payload = NoiseHandshakePayload {
            identity_key: self.identity.public().to_protobuf_encoding(),
            identity_sig: self.identity.secret().sign(&to_sign),
            extensions: Some(NoiseExtensions {
                stream_muxers: self.muxers.clone(),
            }),
        };
        payload.encode_to_vec()
    }

    fn verify_payload(
        &self,
        payload: &[u8],
        state: &snow::HandshakeState,
    ) -> NetworkResult<RemoteIdentity> {
        let payload = NoiseHandshakePayload::decode(payload)
            .map_err(|e| NetworkError::Handshake(format!("malformed handshake payload: {e}")))?;
        let public_key = PublicKey::from_protobuf_encoding(&payload.identity_key)
            .map_err(|e| NetworkError::Handshake(format!("bad remote identity key: {e}")))?;

        let remote_static = state
            .get_remote_static()
            .ok_or_else(|| NetworkError::Handshake("remote static key not yet known".into()))?;
        let mut signed = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + remote_static.len());
        signed.extend_from_slice(STATIC_KEY_DOMAIN);
        signed.extend_from_slice(remote_static);
        public_key
            .verify(&signed, &payload.identity_sig)
            .map_err(|_| NetworkError::Handshake("invalid identity signature".into()))?;

        let muxers = match payload.extensions {
            Some(ext) if ext.stream_muxers.len() <= MAX_EARLY_MUXERS => ext.stream_muxers,
            _ => Vec::new(),
        };

        Ok(RemoteIdentity {
            peer: PeerId::from_public_key(&public_key),
            public_key,
            muxers,
        })
    }
}

struct RemoteIdentity {
    peer: PeerId,
    public_key: PublicKey,
    muxers: Vec<ProtocolId>,
}

async fn send_frame<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    msg: &[u8],
) -> NetworkResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Bytes::copy_from_slice(msg)).await?;
    Ok(())
}

async fn recv_frame<S>(framed: &mut Framed<S, LengthDelimitedCodec>) -> NetworkResult<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(frame) => Ok(frame?),
        None => Err(NetworkError::Handshake(
            "connection closed during handshake".into(),
        )),
    }
}

/// An authenticated, encrypted byte stream.
///
/// Implements tokio `AsyncRead`/`AsyncWrite` over noise transport messages
/// and exposes the identities established by the handshake.
pub struct SecureStream<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    transport: snow::TransportState,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
    local_muxers: Vec<ProtocolId>,
    remote_muxers: Vec<ProtocolId>,
    /// Decrypted bytes not yet handed to the reader.
    read_buffer: BytesMut,
    /// Scratch space for encrypt/decrypt calls.
    plaintext_buf: Vec<u8>,
}

impl<S> std::fmt::Debug for SecureStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("local_peer", &self.local_peer)
            .field("remote_peer", &self.remote_peer)
            .field("remote_public_key", &self.remote_public_key)
            .field("local_muxers", &self.local_muxers)
            .field("remote_muxers", &self.remote_muxers)
            .finish_non_exhaustive()
    }
}

impl<S> SecureStream<S> {
    /// Our peer ID.
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// The authenticated peer ID of the remote.
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// The public key of the remote peer.
    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public_key
    }

    /// First entry of the initiator's muxer preference list also supported
    /// by the responder, per the early data exchanged in the handshake.
    ///
    /// `direction` is the direction of the underlying connection; the
    /// initiator's preference order decides.
    pub fn matched_muxer(&self, direction: Direction) -> Option<ProtocolId> {
        let (initiator, responder) = match direction {
            Direction::Outbound => (&self.local_muxers, &self.remote_muxers),
            Direction::Inbound => (&self.remote_muxers, &self.local_muxers),
        };
        initiator.iter().find(|m| responder.contains(m)).cloned()
    }
}

impl<S> AsyncRead for SecureStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buffer.is_empty() {
                let n = this.read_buffer.len().min(buf.remaining());
                buf.put_slice(&this.read_buffer.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut this.framed).poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    let n = this
                        .transport
                        .read_message(&frame, &mut this.plaintext_buf)
                        .map_err(|e| {
                            io::Error::new(io::ErrorKind::InvalidData, format!("decrypt: {e}"))
                        })?;
                    this.read_buffer.extend_from_slice(&this.plaintext_buf[..n]);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())), // clean EOF
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for SecureStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.framed).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        let chunk = buf.len().min(MAX_WRITE_LEN);
        let n = this
            .transport
            .write_message(&buf[..chunk], &mut this.plaintext_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("encrypt: {e}")))?;
        Pin::new(&mut this.framed)
            .start_send(Bytes::copy_from_slice(&this.plaintext_buf[..n]))?;
        Poll::Ready(Ok(chunk))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().framed).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().framed).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn transport(muxers: &[&str]) -> NoiseTransport {
        NoiseTransport::new(
            Keypair::generate(),
            muxers.iter().map(|m| m.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let dialer = transport(&["/yamux/1.0.0"]);
        let listener = transport(&["/yamux/1.0.0"]);
        let (client, server) = tokio::io::duplex(65536);

        let (outbound, inbound) = tokio::join!(
            dialer.secure_outbound(client, Some(listener.local_peer())),
            listener.secure_inbound(server, None),
        );
        let outbound = outbound.unwrap();
        let inbound = inbound.unwrap();

        assert_eq!(outbound.remote_peer(), listener.local_peer());
        assert_eq!(inbound.remote_peer(), dialer.local_peer());
        assert_eq!(
            inbound.remote_public_key().to_protobuf_encoding(),
            dialer.identity.public().to_protobuf_encoding()
        );
    }

    #[tokio::test]
    async fn test_secure_stream_carries_data_both_ways() {
        let dialer = transport(&[]);
        let listener = transport(&[]);
        let (client, server) = tokio::io::duplex(65536);

        let (outbound, inbound) = tokio::join!(
            dialer.secure_outbound(client, None),
            listener.secure_inbound(server, None),
        );
        let mut outbound = outbound.unwrap();
        let mut inbound = inbound.unwrap();

        outbound.write_all(b"ping").await.unwrap();
        outbound.flush().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        inbound.flush().await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_large_writes_are_chunked() {
        let dialer = transport(&[]);
        let listener = transport(&[]);
        let (client, server) = tokio::io::duplex(1 << 20);

        let (outbound, inbound) = tokio::join!(
            dialer.secure_outbound(client, None),
            listener.secure_inbound(server, None),
        );
        let mut outbound = outbound.unwrap();
        let mut inbound = inbound.unwrap();

        let payload = vec![0xabu8; 100_000];
        let write = async {
            outbound.write_all(&payload).await.unwrap();
            outbound.flush().await.unwrap();
        };
        let read = async {
            let mut buf = vec![0u8; payload.len()];
            inbound.read_exact(&mut buf).await.unwrap();
            buf
        };
        let (_, received) = tokio::join!(write, read);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_peer_id_mismatch_is_rejected() {
        let dialer = transport(&[]);
        let listener = transport(&[]);
        let somebody_else = PeerId::from_public_key(Keypair::generate().public());
        let (client, server) = tokio::io::duplex(65536);

        let (outbound, _) = tokio::join!(
            dialer.secure_outbound(client, Some(&somebody_else)),
            listener.secure_inbound(server, None),
        );
        match outbound.unwrap_err() {
            NetworkError::PeerIdMismatch { expected, actual } => {
                assert_eq!(expected, somebody_else);
                assert_eq!(&actual, listener.local_peer());
            }
            other => panic!("expected PeerIdMismatch, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_early_data_muxer_match() {
        let dialer = transport(&["/mplex/6.7.0", "/yamux/1.0.0"]);
        let listener = transport(&["/yamux/1.0.0"]);
        let (client, server) = tokio::io::duplex(65536);

        let (outbound, inbound) = tokio::join!(
            dialer.secure_outbound(client, None),
            listener.secure_inbound(server, None),
        );
        let outbound = outbound.unwrap();
        let inbound = inbound.unwrap();

        // Initiator preference order decides; mplex is not shared.
        assert_eq!(
            outbound.matched_muxer(Direction::Outbound).unwrap(),
            "/yamux/1.0.0"
        );
        assert_eq!(
            inbound.matched_muxer(Direction::Inbound).unwrap(),
            "/yamux/1.0.0"
        );
    }

    #[tokio::test]
    async fn test_no_muxer_overlap_matches_nothing() {
        let dialer = transport(&["/mplex/6.7.0"]);
        let listener = transport(&["/yamux/1.0.0"]);
        let (client, server) = tokio::io::duplex(65536);

        let (outbound, _) = tokio::join!(
            dialer.secure_outbound(client, None),
            listener.secure_inbound(server, None),
        );
        assert!(outbound.unwrap().matched_muxer(Direction::Outbound).is_none());
    }
}
