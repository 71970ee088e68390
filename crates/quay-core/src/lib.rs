//! # quay-core
//!
//! Transport-independent building blocks for the quay p2p host:
//! - Self-describing multiaddresses
//! - secp256k1 identity keys and public-key-derived peer IDs
//! - The peer address book (peerstore)

mod crypto;
mod error;
mod multiaddr;
mod multihash;
mod peer;
mod peerstore;
mod varint;

pub mod direction;

pub use crypto::{Keypair, PublicKey, SecretKey};
pub use direction::Direction;
pub use error::{CoreError, CoreResult};
pub use multiaddr::{Component, Multiaddr, Protocol};
pub use peer::{
    addr_info_from_p2p_addr, addr_info_from_string, addr_infos_from_p2p_addrs, PeerAddrInfo,
    PeerId,
};
pub use peerstore::PeerStore;

/// Identifier of an application protocol spoken over a stream.
///
/// Protocol identifiers are arbitrary utf-8 strings, by convention
/// path-shaped (`/noise`, `/yamux/1.0.0`, `/eth2/beacon_chain/req/ping`).
pub type ProtocolId = String;
