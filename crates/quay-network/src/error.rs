//! Network error types.

use quay_core::{CoreError, PeerId, ProtocolId};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Which step of the connection upgrade pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStage {
    Security,
    Muxer,
}

impl fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeStage::Security => write!(f, "security"),
            UpgradeStage::Muxer => write!(f, "muxer"),
        }
    }
}

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Address or key material error from the core layer.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Dial requested for a peer with no known addresses.
    #[error("peer {0} has no addresses associated")]
    NoAddresses(PeerId),

    /// Every candidate address failed; per-address failures are logged.
    #[error("failed to dial peer {0}")]
    DialFailed(PeerId),

    /// The upgrade pipeline failed at the given stage.
    #[error("{stage} upgrade failed: {source}")]
    UpgradeFailed {
        stage: UpgradeStage,
        #[source]
        source: Box<NetworkError>,
    },

    /// The handshake authenticated a different identity than requested.
    #[error("peer id mismatch: expected {expected}, but remote key matches {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    /// Negotiation picked a security protocol this node cannot perform.
    #[error("security protocol {0:?} not supported, only /noise is supported")]
    SecurityUnsupported(ProtocolId),

    /// Negotiation picked a muxer protocol this node cannot perform.
    #[error("stream multiplexing protocol {0:?} not supported, only /yamux/1.0.0 is supported")]
    MuxerUnsupported(ProtocolId),

    /// The address requires a transport that is not compiled in.
    #[error("no {0} transport available")]
    TransportUnavailable(&'static str),

    /// The enclosing network has been shut down.
    #[error("network is closed")]
    NetworkClosed,

    /// The listener has been closed; pending and future accepts fail.
    #[error("listener is closed")]
    ListenerClosed,

    /// An operation ran past its deadline.
    #[error("deadline exceeded")]
    Timeout,

    /// An operation was aborted by its caller.
    ///
    /// Callers racing a quay future against their own cancellation signal
    /// report the abort with this kind; internally expired deadlines use
    /// [`NetworkError::Timeout`].
    #[error("operation canceled")]
    Cancelled,

    /// The proposer ran out of candidates, every one rejected by the remote.
    #[error("protocols not supported: {proposed:?}")]
    NegotiationFailed { proposed: Vec<ProtocolId> },

    /// The remote hung up mid-negotiation, which strongly suggests it
    /// rejected everything this side has registered.
    #[error("connection closed by dialer, possibly due to protocols not supported: {supported:?}")]
    ProtocolsNotSupported { supported: Vec<ProtocolId> },

    /// A malformed multistream-select frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The secure channel or muxer session failed.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The muxer session reported an error.
    #[error("muxer error: {0}")]
    Mux(String),

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Reading or writing on a reset stream.
    #[error("stream reset")]
    StreamReset,

    /// Binding a listener failed; carries the host:port for diagnostics.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Invalid host configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<snow::Error> for NetworkError {
    fn from(e: snow::Error) -> Self {
        NetworkError::Handshake(e.to_string())
    }
}

impl From<yamux::ConnectionError> for NetworkError {
    fn from(e: yamux::ConnectionError) -> Self {
        NetworkError::Mux(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
