//! Peer identifiers and peer address records.
//!
//! A peer ID is the multihash of the protobuf-serialized public key. Because
//! secp256k1 keys are short, the identity hash function is used, so the ID
//! embeds the key material itself and the public key can be recovered from
//! the ID alone. Text form is base58 over the multihash bytes.

use crate::multiaddr::Multiaddr;
use crate::{multihash, CoreError, CoreResult, PublicKey};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a peer of the network.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    multihash: Vec<u8>,
}

impl PeerId {
    /// Derive the peer ID from a public key.
    pub fn from_public_key(key: &PublicKey) -> PeerId {
        PeerId {
            multihash: multihash::encode(multihash::IDENTITY, &key.to_protobuf_encoding()),
        }
    }

    /// Validate raw bytes as a peer ID.
    pub fn from_bytes(bytes: Vec<u8>) -> CoreResult<PeerId> {
        let (code, digest) = multihash::decode(&bytes)
            .map_err(|e| CoreError::BadPeerId(e.to_string()))?;
        if code == multihash::IDENTITY {
            // An identity multihash must embed a decodable public key.
            PublicKey::from_protobuf_encoding(digest)
                .map_err(|e| CoreError::BadPeerId(e.to_string()))?;
        }
        Ok(PeerId { multihash: bytes })
    }

    /// The raw multihash bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.multihash
    }

    /// Recover the public key embedded in an identity-hashed peer ID.
    pub fn public_key(&self) -> CoreResult<PublicKey> {
        let (code, digest) = multihash::decode(&self.multihash)?;
        if code != multihash::IDENTITY {
            return Err(CoreError::BadPeerId(
                "peer id does not embed its public key".into(),
            ));
        }
        PublicKey::from_protobuf_encoding(digest)
    }

    /// Base58 text form.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.multihash).into_string()
    }
}

impl FromStr for PeerId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<PeerId> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| CoreError::BadPeerId(format!("failed to parse peer ID: {e}")))?;
        PeerId::from_bytes(bytes)
    }
}

impl From<&PublicKey> for PeerId {
    fn from(key: &PublicKey) -> PeerId {
        PeerId::from_public_key(key)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

/// A peer together with a set of addresses it may be reachable at.
///
/// Addresses are never identities: an address whose `/p2p/` suffix disagrees
/// with `id` is rejected wherever the record is consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddrInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl fmt::Display for PeerAddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: {:?}}}", self.id, self.addrs)
    }
}

/// Convert a `/p2p`-suffixed multiaddress into a [`PeerAddrInfo`].
///
/// A bare `/p2p/<id>` yields an info with no addresses. An address without a
/// `/p2p` part is an error.
pub fn addr_info_from_p2p_addr(addr: &Multiaddr) -> CoreResult<PeerAddrInfo> {
    let (transport, id) = addr.split_p2p();
    let id = id.ok_or_else(|| CoreError::bad_addr(addr.to_string(), "missing /p2p suffix"))?;
    Ok(PeerAddrInfo {
        id,
        addrs: transport.into_iter().collect(),
    })
}

/// Convert a set of `/p2p`-suffixed multiaddresses into per-peer records.
pub fn addr_infos_from_p2p_addrs(addrs: &[Multiaddr]) -> CoreResult<Vec<PeerAddrInfo>> {
    let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
    let mut order = Vec::new();
    for addr in addrs {
        let (transport, id) = addr.split_p2p();
        let id =
            id.ok_or_else(|| CoreError::bad_addr(addr.to_string(), "missing /p2p suffix"))?;
        let entry = by_peer.entry(id.clone()).or_insert_with(|| {
            order.push(id);
            Vec::new()
        });
        entry.extend(transport);
    }
    Ok(order
        .into_iter()
        .map(|id| {
            let addrs = by_peer.remove(&id).unwrap_or_default();
            PeerAddrInfo { id, addrs }
        })
        .collect())
}

/// Build a [`PeerAddrInfo`] from the text form of a `/p2p`-suffixed address.
pub fn addr_info_from_string(s: &str) -> CoreResult<PeerAddrInfo> {
    let addr: Multiaddr = s.parse()?;
    addr_info_from_p2p_addr(&addr)
}
