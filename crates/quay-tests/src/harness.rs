//! Test harness for integration tests.
//!
//! Provides utilities for creating loopback-bound hosts with fresh
//! identities.

use quay_core::{Keypair, Multiaddr, PeerAddrInfo};
use quay_network::Host;
use std::time::Duration;

/// Loopback listen address with an ephemeral port.
pub fn loopback_addr() -> Multiaddr {
    "/ip4/127.0.0.1/tcp/0".parse().expect("valid multiaddr")
}

/// Build a host with a fresh identity, listening on the loopback.
pub async fn create_host() -> Host {
    create_host_with_timeout(Duration::from_secs(5)).await
}

/// Build a host with a fresh identity and the given per-address dial
/// deadline.
pub async fn create_host_with_timeout(timeout: Duration) -> Host {
    quay_network::new(vec![
        quay_network::identity(Keypair::generate()),
        quay_network::listen_addrs(vec![loopback_addr()]),
        quay_network::muxer_option("", ()),
        quay_network::dial_timeout(timeout),
    ])
    .await
    .expect("failed to build host")
}

/// Two hosts plus their dialable address records.
pub async fn create_host_pair() -> (Host, Host, PeerAddrInfo, PeerAddrInfo) {
    let h1 = create_host().await;
    let h2 = create_host().await;
    let info1 = h1.addr_info();
    let info2 = h2.addr_info();
    (h1, h2, info1, info2)
}

/// Let background registration and close tasks settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
