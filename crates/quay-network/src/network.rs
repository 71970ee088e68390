//! Connection registry and dial orchestration.
//!
//! The network keeps inbound and outbound connections in two separate maps
//! keyed by peer ID, because one connection per direction can coexist to
//! the same peer and both must stay enumerable. Snapshot reads take both
//! read locks; `close_peer` takes both write locks in a fixed order
//! (outbound first) to stay deadlock-free. No lock is ever held across a
//! blocking I/O call.

use crate::connection::Connection;
use crate::error::{NetworkError, NetworkResult};
use crate::listener::TcpListenerHandle;
use crate::multistream::{self, MultistreamMuxer, StreamHandler};
use crate::muxer::MuxStream;
use crate::notify::{NoopNotifiee, Notifiee};
use crate::stream::Stream;
use crate::tcp::TcpTransport;
use crate::config::Config;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use quay_core::{
    CoreError, Direction, Multiaddr, PeerAddrInfo, PeerId, PeerStore, Protocol, ProtocolId,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Transports a multiaddress can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportId {
    Tcp,
    Quic,
}

/// Determine the transport for a dial-target multiaddress.
///
/// The address must carry exactly one network-layer component (ip4/ip6) and
/// one transport component (tcp/udp); udp is only acceptable with quic-v1.
/// Components after the transport (e.g. `/tls/sni/...`) are ignored here.
pub fn transport_id(addr: &Multiaddr) -> NetworkResult<TransportId> {
    let bad = |reason: &str| {
        NetworkError::Core(CoreError::BadAddr {
            addr: addr.to_string(),
            reason: reason.to_string(),
        })
    };
    if !addr.has(Protocol::Ip4) && !addr.has(Protocol::Ip6) {
        return Err(bad("no ip"));
    }
    if !addr.has(Protocol::Tcp) && !addr.has(Protocol::Udp) {
        return Err(bad("no transport"));
    }
    if addr.has(Protocol::Tcp) {
        return Ok(TransportId::Tcp);
    }
    if addr.has(Protocol::QuicV1) {
        Ok(TransportId::Quic)
    } else {
        Err(bad("udp without quic-v1"))
    }
}

/// The network layer: accepts and initiates upgraded connections and opens
/// negotiated streams over them.
pub struct Network {
    self_ref: Weak<Network>,
    local: PeerId,
    /// Lock order: `out_conns` before `in_conns`, always.
    out_conns: RwLock<HashMap<PeerId, Arc<Connection>>>,
    in_conns: RwLock<HashMap<PeerId, Arc<Connection>>>,
    tcp_transport: Arc<TcpTransport>,
    tcp_listener: RwLock<Option<Arc<TcpListenerHandle>>>,
    peerstore: Arc<PeerStore>,
    mux: Arc<MultistreamMuxer>,
    notifier: RwLock<Arc<dyn Notifiee>>,
    dial_timeout: Duration,
    closed: AtomicBool,
}

impl Network {
    /// Build a network from a finished configuration and bind its listen
    /// addresses.
    pub(crate) async fn new(config: &Config) -> NetworkResult<Arc<Network>> {
        let identity = config
            .peer_key
            .clone()
            .ok_or_else(|| NetworkError::Config("an identity key is required".into()))?;
        let local = PeerId::from_public_key(identity.public());

        let network = Arc::new_cyclic(|self_ref| Network {
            self_ref: self_ref.clone(),
            local,
            out_conns: RwLock::new(HashMap::new()),
            in_conns: RwLock::new(HashMap::new()),
            tcp_transport: Arc::new(TcpTransport::new(identity)),
            tcp_listener: RwLock::new(None),
            peerstore: Arc::new(PeerStore::new()),
            mux: Arc::new(MultistreamMuxer::new()),
            notifier: RwLock::new(Arc::new(NoopNotifiee)),
            dial_timeout: config.dial_timeout,
            closed: AtomicBool::new(false),
        });

        for addr in &config.listen_addrs {
            network.listen(addr).await?;
        }
        Ok(network)
    }

    /// Our peer ID.
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn peerstore(&self) -> &Arc<PeerStore> {
        &self.peerstore
    }

    /// The muxer dispatching inbound streams to protocol handlers.
    pub fn mux(&self) -> &Arc<MultistreamMuxer> {
        &self.mux
    }

    /// Replace the notifiee receiving lifecycle events.
    pub fn notify(&self, notifiee: Arc<dyn Notifiee>) {
        *self.notifier.write() = notifiee;
    }

    fn ensure_open(&self) -> NetworkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NetworkError::NetworkClosed)
        } else {
            Ok(())
        }
    }

    /// Bind a listen address and serve its inbound connections.
    pub async fn listen(&self, addr: &Multiaddr) -> NetworkResult<()> {
        self.ensure_open()?;
        match transport_id(addr)? {
            TransportId::Tcp => {
                let listener = Arc::new(
                    TcpListenerHandle::bind(self.tcp_transport.clone(), addr).await?,
                );
                *self.tcp_listener.write() = Some(listener.clone());
                let network = self.arc();
                tokio::spawn(async move { network.serve(listener).await });
                Ok(())
            }
            TransportId::Quic => Err(NetworkError::TransportUnavailable("quic")),
        }
    }

    /// The addresses the network is listening on.
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.tcp_listener
            .read()
            .iter()
            .map(|listener| listener.multiaddr())
            .collect()
    }

    fn arc(&self) -> Arc<Network> {
        self.self_ref.upgrade().expect("network is alive")
    }

    /// Accept upgraded inbound connections until the listener closes.
    async fn serve(self: Arc<Network>, listener: Arc<TcpListenerHandle>) {
        loop {
            match listener.accept().await {
                Ok(upgraded) => {
                    let conn = Arc::new(Connection::new(upgraded, Direction::Inbound));
                    self.add_conn(conn);
                }
                Err(NetworkError::ListenerClosed) => return,
                Err(e) => {
                    debug!(error = %e, "inbound connection failed");
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
        }
    }

    /// Register a connection, start its stream-accept loop, and notify.
    fn add_conn(&self, conn: Arc<Connection>) {
        let table = match conn.direction() {
            Direction::Outbound => &self.out_conns,
            Direction::Inbound => &self.in_conns,
        };
        table
            .write()
            .insert(conn.remote_peer().clone(), conn.clone());

        self.spawn_stream_accept_loop(conn.clone());

        // Synchronous, after registration; the notifiee must not block.
        let notifiee = self.notifier.read().clone();
        notifiee.connected(self, &conn);
    }

    /// Every registered connection serves inbound substreams, whichever
    /// side opened it.
    fn spawn_stream_accept_loop(&self, conn: Arc<Connection>) {
        let mux = self.mux.clone();
        tokio::spawn(async move {
            loop {
                match conn.accept_stream().await {
                    Ok(raw) => {
                        tokio::spawn(dispatch_stream(mux.clone(), conn.clone(), raw));
                    }
                    Err(_) => return,
                }
            }
        });
    }

    fn get_existing_conn(
        &self,
        id: &PeerId,
        tables: &[&RwLock<HashMap<PeerId, Arc<Connection>>>],
    ) -> Option<Arc<Connection>> {
        for table in tables {
            if let Some(conn) = table.read().get(id) {
                if !conn.is_closed() {
                    return Some(conn.clone());
                }
            }
        }
        None
    }

    /// Ensure there is an outbound connection to `info.id`, dialing if
    /// needed, and absorb `info.addrs` into the peerstore.
    ///
    /// Reuse checks the outbound table only; an inbound-only peer is dialed
    /// fresh.
    pub async fn connect(&self, info: &PeerAddrInfo) -> NetworkResult<()> {
        self.ensure_open()?;
        self.peerstore.set_addrs(info);

        if self
            .get_existing_conn(&info.id, &[&self.out_conns])
            .is_some()
        {
            return Ok(());
        }
        self.dial_peer(&info.id).await.map(|_| ())
    }

    /// Dial every known address of a peer in order until one upgrades.
    ///
    /// Per-address failures are logged and swallowed; only the aggregate
    /// [`NetworkError::DialFailed`] surfaces.
    pub async fn dial_peer(&self, id: &PeerId) -> NetworkResult<Arc<Connection>> {
        self.ensure_open()?;
        let addrs = self.peerstore.addrs(id);
        if addrs.is_empty() {
            return Err(NetworkError::NoAddresses(id.clone()));
        }

        for addr in addrs {
            let transport = match transport_id(&addr) {
                Ok(transport) => transport,
                Err(e) => {
                    info!(peer = %id, addr = %addr, error = %e,
                        "Failed to dial peer, transport protocol not supported");
                    continue;
                }
            };
            match transport {
                TransportId::Tcp => {
                    // A fresh deadline for every address.
                    let attempt = tokio::time::timeout(
                        self.dial_timeout,
                        self.tcp_transport.dial(&addr, Some(id)),
                    )
                    .await
                    .map_err(NetworkError::from)
                    .and_then(|dialed| dialed);
                    match attempt {
                        Ok(upgraded) => {
                            let conn = Arc::new(Connection::new(upgraded, Direction::Outbound));
                            self.add_conn(conn.clone());
                            return Ok(conn);
                        }
                        Err(e) => {
                            info!(peer = %id, addr = %addr, error = %e, "Failed to dial peer");
                        }
                    }
                }
                TransportId::Quic => return Err(NetworkError::TransportUnavailable("quic")),
            }
        }
        Err(NetworkError::DialFailed(id.clone()))
    }

    /// Open a stream to a peer and negotiate one of `protos` on it.
    ///
    /// An alive connection in either table is reused (outbound preferred);
    /// otherwise a fresh outbound connection is dialed.
    pub async fn new_stream(&self, id: &PeerId, protos: &[ProtocolId]) -> NetworkResult<Stream> {
        self.ensure_open()?;
        let conn = match self.get_existing_conn(id, &[&self.out_conns, &self.in_conns]) {
            Some(conn) => conn,
            None => self.dial_peer(id).await?,
        };

        let mut raw = conn.open_stream().await?;
        let proto = multistream::select_one_of(protos, &mut raw).await?;
        Ok(Stream::new(
            raw,
            Arc::downgrade(&conn),
            proto,
            Direction::Outbound,
        ))
    }

    /// Register a handler for inbound streams negotiated to `proto`.
    /// Thread-safe against concurrent dispatch.
    pub fn set_stream_handler<F, Fut>(&self, proto: impl Into<ProtocolId>, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: StreamHandler =
            Arc::new(move |stream| Box::pin(handler(stream)) as BoxFuture<'static, ()>);
        self.mux.add_handler(proto.into(), Some(handler));
    }

    /// Remove a handler registered with `set_stream_handler`.
    pub fn remove_stream_handler(&self, proto: &str) {
        self.mux.remove_handler(proto);
    }

    /// Close every connection in both tables and all listeners.
    /// Idempotent; per-connection close errors are swallowed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let conns: Vec<Arc<Connection>> = {
            let mut out = self.out_conns.write();
            let mut inb = self.in_conns.write();
            out.drain().map(|(_, c)| c).chain(inb.drain().map(|(_, c)| c)).collect()
        };
        for conn in conns {
            conn.close().await;
        }

        let listener = self.tcp_listener.write().take();
        if let Some(listener) = listener {
            listener.close();
        }
    }

    /// Remove and asynchronously close all connections to a peer.
    /// Returns promptly without waiting for the closes.
    pub fn close_peer(&self, id: &PeerId) {
        let mut removed = Vec::with_capacity(2);
        {
            let mut out = self.out_conns.write();
            let mut inb = self.in_conns.write();
            if let Some(conn) = out.remove(id) {
                removed.push(conn);
            }
            if let Some(conn) = inb.remove(id) {
                removed.push(conn);
            }
        }
        for conn in removed {
            tokio::spawn(async move { conn.close().await });
        }
    }

    /// A consistent snapshot of every connection in both tables.
    pub fn conns(&self) -> Vec<Arc<Connection>> {
        let out = self.out_conns.read();
        let inb = self.in_conns.read();
        out.values().chain(inb.values()).cloned().collect()
    }

    /// The connections to one peer: at most one per direction.
    pub fn conns_to_peer(&self, id: &PeerId) -> Vec<Arc<Connection>> {
        let out = self.out_conns.read();
        let inb = self.in_conns.read();
        out.get(id).into_iter().chain(inb.get(id)).cloned().collect()
    }

    /// The peers with at least one registered connection.
    pub fn peers(&self) -> Vec<PeerId> {
        let out = self.out_conns.read();
        let inb = self.in_conns.read();
        let mut peers: Vec<PeerId> = out.keys().chain(inb.keys()).cloned().collect();
        peers.sort();
        peers.dedup();
        peers
    }
}

async fn dispatch_stream(mux: Arc<MultistreamMuxer>, conn: Arc<Connection>, mut raw: MuxStream) {
    match mux.negotiate(&mut raw).await {
        Ok(proto) => {
            let Some(handler) = mux.handler(&proto) else {
                debug!(proto = %proto, "no handler behind negotiated protocol, resetting stream");
                raw.reset();
                return;
            };
            let stream = Stream::new(raw, Arc::downgrade(&conn), proto, Direction::Inbound);
            handler(stream).await;
        }
        Err(e) => {
            debug!(error = %e, "inbound stream negotiation failed");
            raw.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_transport_id_selection() {
        assert_eq!(
            transport_id(&ma("/ip4/127.0.0.1/tcp/1")).unwrap(),
            TransportId::Tcp
        );
        assert_eq!(
            transport_id(&ma("/ip6/::1/tcp/1")).unwrap(),
            TransportId::Tcp
        );
        assert_eq!(
            transport_id(&ma("/ip4/127.0.0.1/udp/1/quic-v1")).unwrap(),
            TransportId::Quic
        );
        assert_eq!(
            transport_id(&ma("/ip6/::1/udp/1/quic-v1")).unwrap(),
            TransportId::Quic
        );
        // Extra components after the transport do not affect selection.
        assert_eq!(
            transport_id(&ma("/ip4/127.0.0.1/tcp/443/tls/sni/example.com")).unwrap(),
            TransportId::Tcp
        );
    }

    #[test]
    fn test_transport_id_rejections() {
        let cases = [
            ("/dns4/example.com/tcp/443", "no ip"),
            ("/ip4/127.0.0.1", "no transport"),
            ("/ip4/127.0.0.1/udp/443", "udp without quic-v1"),
        ];
        for (addr, reason) in cases {
            let err = transport_id(&ma(addr)).unwrap_err();
            assert!(
                err.to_string().contains(reason),
                "{addr}: expected {reason:?} in {err}"
            );
        }
    }
}
