//! # quay-network
//!
//! The network layer of the quay p2p host:
//! - multistream-select protocol negotiation
//! - the connection upgrade pipeline (noise security, yamux multiplexing)
//! - the TCP transport with its concurrent-upgrade listener
//! - the connection registry, dial orchestration and stream dispatch
//! - the host facade and its option-based configuration
//!
//! ```no_run
//! # async fn run() -> quay_network::NetworkResult<()> {
//! use quay_core::Keypair;
//!
//! let host = quay_network::new(vec![
//!     quay_network::identity(Keypair::generate()),
//!     quay_network::listen_addrs(vec!["/ip4/127.0.0.1/tcp/0".parse()?]),
//! ])
//! .await?;
//!
//! host.set_stream_handler("/echo/1.0.0", |stream| async move {
//!     // handle the stream
//!     drop(stream);
//! });
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
mod host;
mod listener;
mod multistream;
mod muxer;
mod network;
mod noise;
mod stream;
mod tcp;
mod upgrade;

pub mod notify;

pub use config::{
    addrs_factory, apply, connection_gater, dial_timeout, disable_relay, identity, listen_addrs,
    muxer as muxer_option, nat_port_map, ping, resource_manager, security, transport, user_agent,
    AddrsFactory, Config, HostOption,
};
pub use connection::{ConnState, ConnStats, Connection};
pub use error::{NetworkError, NetworkResult, UpgradeStage};
pub use host::Host;
pub use listener::TcpListenerHandle;
pub use multistream::{select_one_of, MultistreamMuxer, StreamHandler, PROTOCOL_HEADER};
pub use muxer::{multiplex, MuxStream, MuxedConn};
pub use network::{transport_id, Network, TransportId};
pub use noise::{NoiseTransport, SecureStream};
pub use stream::Stream;
pub use tcp::{TcpTransport, TcpTransportOptions};
pub use upgrade::UpgradedConn;

/// Protocol identifier of the supported security protocol.
pub const NOISE_ID: &str = noise::PROTOCOL_ID;

/// Protocol identifier of the supported stream multiplexer.
pub const YAMUX_ID: &str = muxer::PROTOCOL_ID;

/// Build a host from configuration options.
pub async fn new(options: Vec<HostOption>) -> NetworkResult<Host> {
    let config = apply(options)?;
    Host::new(config).await
}
