//! Host facade tests.

use crate::harness::{create_host, loopback_addr};
use quay_core::{Component, Keypair, Multiaddr, PeerId};
use quay_network::NetworkError;

#[tokio::test]
async fn test_id_matches_identity_key() {
    let keypair = Keypair::generate();
    let expected = PeerId::from_public_key(keypair.public());

    let host = quay_network::new(vec![
        quay_network::identity(keypair),
        quay_network::listen_addrs(vec![loopback_addr()]),
    ])
    .await
    .unwrap();

    assert_eq!(host.id(), &expected);
    host.close().await;
}

#[tokio::test]
async fn test_new_without_identity_fails() {
    let result = quay_network::new(vec![quay_network::listen_addrs(vec![loopback_addr()])]).await;
    assert!(matches!(result.unwrap_err(), NetworkError::Config(_)));
}

#[tokio::test]
async fn test_addr_info_is_dialable() {
    let h1 = create_host().await;
    let h2 = create_host().await;

    let info = h2.addr_info();
    assert_eq!(info.id, *h2.id());
    assert!(!info.addrs.is_empty());

    h1.connect(&info).await.unwrap();
    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_addrs_factory_transforms_advertised_addrs() {
    let advertised: Multiaddr = "/ip4/203.0.113.7/tcp/4001".parse().unwrap();
    let advertised_in_factory = advertised.clone();

    let host = quay_network::new(vec![
        quay_network::identity(Keypair::generate()),
        quay_network::listen_addrs(vec![loopback_addr()]),
        quay_network::addrs_factory(move |_addrs| vec![advertised_in_factory.clone()]),
    ])
    .await
    .unwrap();

    assert_eq!(host.addrs(), vec![advertised]);
    // The factory shapes the advertised view only, not the actual binds.
    assert!(host.network().listen_addresses()[0]
        .iter()
        .any(|c| matches!(c, Component::Tcp(port) if *port != 4001)));

    host.close().await;
}

#[tokio::test]
async fn test_user_agent_is_carried() {
    let host = quay_network::new(vec![
        quay_network::identity(Keypair::generate()),
        quay_network::listen_addrs(vec![loopback_addr()]),
        quay_network::user_agent("quay/test"),
    ])
    .await
    .unwrap();

    assert_eq!(host.user_agent(), "quay/test");
    host.close().await;
}

#[tokio::test]
async fn test_listen_addr_collision_reports_address() {
    let first = create_host().await;
    let taken = first.network().listen_addresses()[0].clone();

    let result = quay_network::new(vec![
        quay_network::identity(Keypair::generate()),
        quay_network::listen_addrs(vec![taken.clone()]),
    ])
    .await;

    let err = result.unwrap_err();
    assert!(matches!(err, NetworkError::Listen { .. }));
    let socket_addr = taken.to_socket_addr().unwrap();
    assert!(err.to_string().contains(&socket_addr.to_string()));

    first.close().await;
}

#[tokio::test]
async fn test_quic_listen_addr_is_unavailable() {
    let result = quay_network::new(vec![
        quay_network::identity(Keypair::generate()),
        quay_network::listen_addrs(vec!["/ip4/127.0.0.1/udp/0/quic-v1".parse().unwrap()]),
    ])
    .await;
    assert!(matches!(
        result.unwrap_err(),
        NetworkError::TransportUnavailable("quic")
    ));
}
