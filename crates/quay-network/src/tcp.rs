//! TCP transport.
//!
//! Dials and listens over TCP multiaddresses, producing raw connections
//! that are immediately run through the upgrade pipeline (security, then
//! stream multiplexing).

use crate::error::NetworkResult;
use crate::multistream::MultistreamMuxer;
use crate::noise::{self, NoiseTransport};
use crate::upgrade::{upgrade, UpgradedConn};
use crate::muxer;
use quay_core::{Component, Direction, Keypair, Multiaddr, PeerId, ProtocolId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Tunables of the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransportOptions {
    /// Maximum duration between obtaining a raw TCP connection and returning
    /// a fully upgraded connection; also bounds how long an upgraded inbound
    /// connection may wait for a consumer.
    pub accept_timeout: Duration,
    /// Security protocol proposed in the protocol selection.
    pub security_supported: ProtocolId,
    /// Stream multiplexing protocol proposed in the protocol selection.
    pub muxer_supported: ProtocolId,
    /// Skip muxer selection when the noise early data already agrees on the
    /// sole supported muxer. Both endpoints must enable this for the wire
    /// exchange to stay in step.
    pub early_muxer_negotiation: bool,
}

impl Default for TcpTransportOptions {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(15),
            security_supported: noise::PROTOCOL_ID.to_string(),
            muxer_supported: muxer::PROTOCOL_ID.to_string(),
            early_muxer_negotiation: false,
        }
    }
}

/// TCP transport: dial/listen plus the shared upgrade machinery.
pub struct TcpTransport {
    pub(crate) security_muxer: MultistreamMuxer,
    pub(crate) stream_muxer: MultistreamMuxer,
    pub(crate) noise: NoiseTransport,
    pub(crate) options: TcpTransportOptions,
}

impl TcpTransport {
    pub fn new(identity: Keypair) -> TcpTransport {
        TcpTransport::with_options(identity, TcpTransportOptions::default())
    }

    pub fn with_options(identity: Keypair, options: TcpTransportOptions) -> TcpTransport {
        let security_muxer = MultistreamMuxer::new();
        security_muxer.add_handler(options.security_supported.clone(), None);
        let stream_muxer = MultistreamMuxer::new();
        stream_muxer.add_handler(options.muxer_supported.clone(), None);
        let noise = NoiseTransport::new(identity, vec![options.muxer_supported.clone()]);
        TcpTransport {
            security_muxer,
            stream_muxer,
            noise,
            options,
        }
    }

    /// Dial the given multiaddr and upgrade the resulting outbound
    /// connection.
    ///
    /// With `expected` set, the upgrade fails unless the handshake
    /// authenticates exactly that peer.
    pub async fn dial(
        &self,
        addr: &Multiaddr,
        expected: Option<&PeerId>,
    ) -> NetworkResult<UpgradedConn> {
        let socket_addr = addr.to_socket_addr()?;
        let raw = TcpStream::connect(socket_addr).await?;
        debug!(addr = %addr, "tcp connection established, upgrading");
        upgrade(self, raw, expected, Direction::Outbound).await
    }
}

/// Render a socket address as a transport multiaddress.
pub(crate) fn socket_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        std::net::IpAddr::V4(ip) => Component::Ip4(ip),
        std::net::IpAddr::V6(ip) => Component::Ip6(ip),
    };
    Multiaddr::from_components(vec![ip, Component::Tcp(addr.port())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = TcpTransportOptions::default();
        assert_eq!(options.accept_timeout, Duration::from_secs(15));
        assert_eq!(options.security_supported, "/noise");
        assert_eq!(options.muxer_supported, "/yamux/1.0.0");
        assert!(!options.early_muxer_negotiation);
    }

    #[test]
    fn test_socket_to_multiaddr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(socket_to_multiaddr(&addr).to_string(), "/ip4/127.0.0.1/tcp/9000");

        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(socket_to_multiaddr(&addr).to_string(), "/ip6/::1/tcp/80");
    }
}
