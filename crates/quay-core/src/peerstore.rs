//! Peer address book.

use crate::multiaddr::Multiaddr;
use crate::peer::{PeerAddrInfo, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::warn;

/// Maps peer IDs to the transport addresses they were last announced at.
///
/// Entries are replaced wholesale by [`PeerStore::set_addrs`]; there are no
/// TTLs and no sourcing metadata.
#[derive(Default)]
pub struct PeerStore {
    addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl PeerStore {
    pub fn new() -> PeerStore {
        PeerStore::default()
    }

    /// Replace the stored addresses for `info.id`.
    ///
    /// Duplicates are discarded, `/p2p/` suffixes are stripped, and addresses
    /// whose embedded peer ID disagrees with `info.id` or that carry no
    /// transport part are logged and dropped.
    pub fn set_addrs(&self, info: &PeerAddrInfo) {
        let mut kept: Vec<Multiaddr> = Vec::with_capacity(info.addrs.len());
        for addr in &info.addrs {
            let (transport, addr_pid) = addr.split_p2p();
            if let Some(addr_pid) = addr_pid {
                if addr_pid != info.id {
                    warn!(
                        peer = %info.id,
                        addr = %addr,
                        embedded = %addr_pid,
                        "dropping address announced with a different peer id"
                    );
                    continue;
                }
            }
            let Some(transport) = transport else {
                warn!(peer = %info.id, addr = %addr, "dropping address with no transport part");
                continue;
            };
            if !kept.contains(&transport) {
                kept.push(transport);
            }
        }
        self.addrs.write().insert(info.id.clone(), kept);
    }

    /// The stored addresses for a peer, possibly empty.
    pub fn addrs(&self, id: &PeerId) -> Vec<Multiaddr> {
        self.addrs.read().get(id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    fn peer_id() -> PeerId {
        PeerId::from_public_key(Keypair::generate().public())
    }

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_set_addrs_replaces() {
        let store = PeerStore::new();
        let id = peer_id();

        store.set_addrs(&PeerAddrInfo {
            id: id.clone(),
            addrs: vec![ma("/ip4/127.0.0.1/tcp/1")],
        });
        assert_eq!(store.addrs(&id), vec![ma("/ip4/127.0.0.1/tcp/1")]);

        store.set_addrs(&PeerAddrInfo {
            id: id.clone(),
            addrs: vec![ma("/ip4/127.0.0.1/tcp/2")],
        });
        assert_eq!(store.addrs(&id), vec![ma("/ip4/127.0.0.1/tcp/2")]);
    }

    #[test]
    fn test_set_addrs_dedups_and_strips_suffix() {
        let store = PeerStore::new();
        let id = peer_id();
        let plain = ma("/ip4/10.0.0.1/tcp/4001");

        store.set_addrs(&PeerAddrInfo {
            id: id.clone(),
            addrs: vec![
                plain.clone(),
                plain.clone(),
                plain.with_p2p(id.clone()),
                ma("/ip4/10.0.0.2/tcp/4001"),
            ],
        });
        assert_eq!(store.addrs(&id), vec![plain, ma("/ip4/10.0.0.2/tcp/4001")]);
    }

    #[test]
    fn test_set_addrs_drops_mismatched_peer_id() {
        let store = PeerStore::new();
        let id = peer_id();
        let other = peer_id();

        store.set_addrs(&PeerAddrInfo {
            id: id.clone(),
            addrs: vec![ma("/ip4/10.0.0.1/tcp/4001").with_p2p(other)],
        });
        assert!(store.addrs(&id).is_empty());
    }

    #[test]
    fn test_set_addrs_ignores_bare_p2p() {
        let store = PeerStore::new();
        let id = peer_id();

        // A bare /p2p/<id> contributes no address but is not an error.
        store.set_addrs(&PeerAddrInfo {
            id: id.clone(),
            addrs: vec![
                Multiaddr::empty().with_p2p(id.clone()),
                ma("/ip4/10.0.0.1/tcp/4001"),
            ],
        });
        assert_eq!(store.addrs(&id), vec![ma("/ip4/10.0.0.1/tcp/4001")]);
    }

    #[test]
    fn test_addrs_unknown_peer_is_empty() {
        let store = PeerStore::new();
        assert!(store.addrs(&peer_id()).is_empty());
    }
}
