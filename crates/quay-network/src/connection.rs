//! Registered connections.

use crate::error::NetworkResult;
use crate::muxer::MuxStream;
use crate::upgrade::UpgradedConn;
use quay_core::{Direction, Multiaddr, PeerId, PublicKey};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Lifecycle of a connection.
///
/// Transitions are monotonic. `Upgrading` belongs to the pipeline; entries
/// in the registry start at `Alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    Upgrading = 0,
    Alive = 1,
    Closing = 2,
    Closed = 3,
}

/// Immutable metadata of a connection.
#[derive(Debug, Clone)]
pub struct ConnStats {
    pub direction: Direction,
    pub opened: Instant,
}

/// A secured, multiplexed connection registered with the network.
///
/// Owns its upgraded session exclusively; identified externally by its
/// remote peer ID.
pub struct Connection {
    inner: UpgradedConn,
    stats: ConnStats,
    state: AtomicU8,
}

impl Connection {
    pub(crate) fn new(inner: UpgradedConn, direction: Direction) -> Connection {
        Connection {
            inner,
            stats: ConnStats {
                direction,
                opened: Instant::now(),
            },
            state: AtomicU8::new(ConnState::Alive as u8),
        }
    }

    pub fn direction(&self) -> Direction {
        self.stats.direction
    }

    pub fn stat(&self) -> &ConnStats {
        &self.stats
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        if self.inner.is_closed() {
            return ConnState::Closed;
        }
        match self.state.load(Ordering::SeqCst) {
            0 => ConnState::Upgrading,
            1 => ConnState::Alive,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    fn advance(&self, state: ConnState) {
        // fetch_max keeps the transitions monotonic under races
        self.state.fetch_max(state as u8, Ordering::SeqCst);
    }

    pub fn local_peer(&self) -> &PeerId {
        self.inner.local_peer()
    }

    pub fn remote_peer(&self) -> &PeerId {
        self.inner.remote_peer()
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        self.inner.remote_public_key()
    }

    pub fn local_multiaddr(&self) -> &Multiaddr {
        self.inner.local_multiaddr()
    }

    pub fn remote_multiaddr(&self) -> &Multiaddr {
        self.inner.remote_multiaddr()
    }

    pub(crate) async fn open_stream(&self) -> NetworkResult<MuxStream> {
        self.inner.open_stream().await
    }

    pub(crate) async fn accept_stream(&self) -> NetworkResult<MuxStream> {
        self.inner.accept_stream().await
    }

    /// Close the connection, draining in-flight streams. Idempotent.
    pub async fn close(&self) {
        self.advance(ConnState::Closing);
        self.inner.close().await;
        self.advance(ConnState::Closed);
    }

    /// Once true, stays true; callers must treat the connection as absent
    /// and dial fresh.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.state.load(Ordering::SeqCst) >= ConnState::Closed as u8
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_peer", &self.remote_peer().to_base58())
            .field("direction", &self.direction())
            .field("state", &self.state())
            .finish()
    }
}
