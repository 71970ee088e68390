//! Connection upgrade pipeline.
//!
//! A raw TCP connection becomes a fully capable one in four steps, all
//! under one shared deadline set before the first step:
//!
//! 1. multistream-select negotiates the security protocol on the raw bytes
//! 2. the noise handshake authenticates and encrypts the connection
//! 3. multistream-select negotiates the muxer protocol on the secure bytes
//!    (skippable via the noise early-data muxer list)
//! 4. yamux layers substreams over the secure connection
//!
//! The result mixes three capability sets behind one struct: the muxed
//! session, the secure identity, and the raw connection's addresses. The
//! addresses are deliberately taken from the pre-upgrade socket so logs
//! show what was actually dialed or accepted.

use crate::error::{NetworkError, NetworkResult, UpgradeStage};
use crate::muxer::{self, multiplex, MuxStream, MuxedConn};
use crate::multistream;
use crate::noise::{self, SecureStream};
use crate::tcp::{socket_to_multiaddr, TcpTransport};
use quay_core::{Direction, Multiaddr, PeerId, PublicKey};
use tokio::net::TcpStream;
use tracing::debug;

/// A connection that has been secured and multiplexed.
pub struct UpgradedConn {
    muxed: MuxedConn,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
}

impl std::fmt::Debug for UpgradedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedConn")
            .field("local_peer", &self.local_peer)
            .field("remote_peer", &self.remote_peer)
            .field("remote_public_key", &self.remote_public_key)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl UpgradedConn {
    /// Create a new substream over this connection.
    pub async fn open_stream(&self) -> NetworkResult<MuxStream> {
        self.muxed.open_stream().await
    }

    /// Wait for a substream opened by the remote.
    pub async fn accept_stream(&self) -> NetworkResult<MuxStream> {
        self.muxed.accept_stream().await
    }

    /// Close the muxer session and the underlying connection.
    pub async fn close(&self) {
        self.muxed.close().await;
    }

    /// Whether the connection is fully closed.
    pub fn is_closed(&self) -> bool {
        self.muxed.is_closed()
    }

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

    /// The local address of the underlying raw connection.
    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_addr
    }

    /// The remote address of the underlying raw connection.
    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_addr
    }
}

struct SecureIdentity {
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
}

/// Run the upgrade pipeline on a raw connection.
///
/// Any failure closes the raw connection.
pub(crate) async fn upgrade(
    transport: &TcpTransport,
    raw: TcpStream,
    expected: Option<&PeerId>,
    direction: Direction,
) -> NetworkResult<UpgradedConn> {
    let local_addr = socket_to_multiaddr(&raw.local_addr()?);
    let remote_addr = socket_to_multiaddr(&raw.peer_addr()?);
    let deadline = tokio::time::Instant::now() + transport.options.accept_timeout;

    let secure = match tokio::time::timeout_at(
        deadline,
        secure_stage(transport, raw, expected, direction),
    )
    .await
    {
        Ok(Ok(secure)) => secure,
        Ok(Err(e)) => return Err(stage_error(UpgradeStage::Security, e)),
        Err(_) => return Err(stage_error(UpgradeStage::Security, NetworkError::Timeout)),
    };

    let (identity, muxed) =
        match tokio::time::timeout_at(deadline, muxer_stage(transport, secure, direction)).await {
            Ok(Ok(upgraded)) => upgraded,
            Ok(Err(e)) => return Err(stage_error(UpgradeStage::Muxer, e)),
            Err(_) => return Err(stage_error(UpgradeStage::Muxer, NetworkError::Timeout)),
        };

    debug!(
        remote = %identity.remote_peer,
        %direction,
        addr = %remote_addr,
        "connection upgraded"
    );

    Ok(UpgradedConn {
        muxed,
        local_peer: identity.local_peer,
        remote_peer: identity.remote_peer,
        remote_public_key: identity.remote_public_key,
        local_addr,
        remote_addr,
    })
}

/// Kinds with their own place in the taxonomy pass through unchanged;
/// everything else is wrapped with the stage that produced it.
fn stage_error(stage: UpgradeStage, e: NetworkError) -> NetworkError {
    match e {
        e @ (NetworkError::PeerIdMismatch { .. }
        | NetworkError::SecurityUnsupported(_)
        | NetworkError::MuxerUnsupported(_)) => e,
        other => NetworkError::UpgradeFailed {
            stage,
            source: Box::new(other),
        },
    }
}

async fn secure_stage(
    transport: &TcpTransport,
    mut raw: TcpStream,
    expected: Option<&PeerId>,
    direction: Direction,
) -> NetworkResult<SecureStream<TcpStream>> {
    let proto = match direction {
        Direction::Inbound => transport.security_muxer.negotiate(&mut raw).await?,
        Direction::Outbound => {
            multistream::select_one_of(
                &[transport.options.security_supported.clone()],
                &mut raw,
            )
            .await?
        }
    };
    if proto != noise::PROTOCOL_ID {
        return Err(NetworkError::SecurityUnsupported(proto));
    }

    match direction {
        Direction::Inbound => transport.noise.secure_inbound(raw, expected).await,
        Direction::Outbound => transport.noise.secure_outbound(raw, expected).await,
    }
}

async fn muxer_stage(
    transport: &TcpTransport,
    mut secure: SecureStream<TcpStream>,
    direction: Direction,
) -> NetworkResult<(SecureIdentity, MuxedConn)> {
    let early_match = secure.matched_muxer(direction);
    let proto = if transport.options.early_muxer_negotiation
        && early_match.as_deref() == Some(transport.options.muxer_supported.as_str())
    {
        debug!(muxer = %transport.options.muxer_supported, "muxer agreed via noise early data");
        early_match.expect("checked above")
    } else {
        match direction {
            Direction::Inbound => transport.stream_muxer.negotiate(&mut secure).await?,
            Direction::Outbound => {
                multistream::select_one_of(
                    &[transport.options.muxer_supported.clone()],
                    &mut secure,
                )
                .await?
            }
        }
    };
    if proto != muxer::PROTOCOL_ID {
        return Err(NetworkError::MuxerUnsupported(proto));
    }

    let identity = SecureIdentity {
        local_peer: secure.local_peer().clone(),
        remote_peer: secure.remote_peer().clone(),
        remote_public_key: secure.remote_public_key().clone(),
    };
    Ok((identity, multiplex(secure, direction)))
}
