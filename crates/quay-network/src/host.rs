//! Host facade.
//!
//! A thin binding of the protocol-handler muxer to the network: everything
//! here forwards. The host is the root owner; closing it closes the
//! network, which closes all listeners and connections.

use crate::config::{AddrsFactory, Config};
use crate::error::NetworkResult;
use crate::multistream::MultistreamMuxer;
use crate::network::Network;
use crate::stream::Stream;
use quay_core::{Multiaddr, PeerAddrInfo, PeerId, PeerStore, ProtocolId};
use std::future::Future;
use std::sync::Arc;

/// A p2p host: an identity, a network, and a protocol-handler registry.
pub struct Host {
    network: Arc<Network>,
    addrs_factory: Option<AddrsFactory>,
    user_agent: String,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub(crate) async fn new(config: Config) -> NetworkResult<Host> {
        let network = Network::new(&config).await?;
        Ok(Host {
            network,
            addrs_factory: config.addrs_factory,
            user_agent: config.user_agent,
        })
    }

    /// The local peer ID.
    pub fn id(&self) -> &PeerId {
        self.network.local_peer()
    }

    /// The host's repository of peer addresses.
    pub fn peerstore(&self) -> &Arc<PeerStore> {
        self.network.peerstore()
    }

    /// The listen addresses of the host, as transformed by the configured
    /// address factory.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let addrs = self.network.listen_addresses();
        match &self.addrs_factory {
            Some(factory) => factory(addrs),
            None => addrs,
        }
    }

    /// The network of the host.
    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// The muxer multiplexing inbound streams to protocol handlers.
    pub fn mux(&self) -> &Arc<MultistreamMuxer> {
        self.network.mux()
    }

    /// Identifier reported at the identify layer; unused by the core.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Ensure there is a connection between this host and the given peer,
    /// absorbing its addresses into the peerstore. Blocks until a
    /// connection is open or an error is returned.
    pub async fn connect(&self, info: &PeerAddrInfo) -> NetworkResult<()> {
        self.network.connect(info).await
    }

    /// Register a protocol handler on the host's muxer. Thread-safe.
    pub fn set_stream_handler<F, Fut>(&self, proto: impl Into<ProtocolId>, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.network.set_stream_handler(proto, handler);
    }

    /// Remove a handler set by [`Host::set_stream_handler`].
    pub fn remove_stream_handler(&self, proto: &str) {
        self.network.remove_stream_handler(proto);
    }

    /// Open a new stream to the given peer, negotiating one of `protos`.
    /// Dials if there is no usable connection. Thread-safe.
    pub async fn new_stream(&self, id: &PeerId, protos: &[ProtocolId]) -> NetworkResult<Stream> {
        self.network.new_stream(id, protos).await
    }

    /// The host's own address record, suitable for handing to another
    /// host's `connect`.
    pub fn addr_info(&self) -> PeerAddrInfo {
        PeerAddrInfo {
            id: self.id().clone(),
            addrs: self.addrs(),
        }
    }

    /// Shut down the host and its network. Safe to call multiple times.
    pub async fn close(&self) {
        self.network.close().await;
    }
}
