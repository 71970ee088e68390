//! TCP listener with concurrent inbound upgrades.
//!
//! For each raw connection accepted by the bind, a task runs the upgrade
//! pipeline so slow handshakes never hold up the accept loop. Upgraded
//! connections land on a rendezvous channel drained by [`TcpListenerHandle::
//! accept`]; upgrade failures land on a separate error channel. An upgraded
//! connection nobody consumes within the accept timeout is closed again.

use crate::error::{NetworkError, NetworkResult};
use crate::tcp::{socket_to_multiaddr, TcpTransport};
use crate::upgrade::{upgrade, UpgradedConn};
use quay_core::{Direction, Multiaddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Channels = (
    mpsc::Receiver<UpgradedConn>,
    mpsc::Receiver<NetworkError>,
);

/// Handle to a listening TCP transport.
pub struct TcpListenerHandle {
    addr: Multiaddr,
    channels: Mutex<Channels>,
    /// One permit per waiting `accept` call; upgraders only hand over a
    /// connection once a consumer has announced itself.
    demand: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TcpListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListenerHandle")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl TcpListenerHandle {
    /// Bind `addr` and serve inbound connections over the given transport.
    ///
    /// Each accepted raw connection is upgraded in its own task; the accept
    /// loop never waits on an upgrade. A bind failure surfaces verbatim
    /// together with the host:port it was for.
    pub async fn bind(
        transport: Arc<TcpTransport>,
        addr: &Multiaddr,
    ) -> NetworkResult<TcpListenerHandle> {
        let socket_addr = addr.to_socket_addr()?;
        let listener = TcpListener::bind(socket_addr)
            .await
            .map_err(|source| NetworkError::Listen {
                addr: socket_addr,
                source,
            })?;
        let local_addr = socket_to_multiaddr(&listener.local_addr()?);
        debug!(addr = %local_addr, "listening");

        // The incoming channel stays a rendezvous: upgraders block handing a
        // connection over until an accept call has signaled demand, or give
        // up after the accept timeout.
        let (conn_tx, conn_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let demand = Arc::new(Semaphore::new(0));
        let cancel = CancellationToken::new();

        tokio::spawn(serve(
            listener,
            transport,
            conn_tx,
            err_tx,
            demand.clone(),
            cancel.clone(),
        ));

        Ok(TcpListenerHandle {
            addr: local_addr,
            channels: Mutex::new((conn_rx, err_rx)),
            demand,
            cancel,
        })
    }

    /// Deliver the next upgraded connection or the next upgrade error.
    ///
    /// After [`TcpListenerHandle::close`], pending and future calls fail
    /// with [`NetworkError::ListenerClosed`].
    pub async fn accept(&self) -> NetworkResult<UpgradedConn> {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::ListenerClosed);
        }
        let mut channels = self.channels.lock().await;
        let (conn_rx, err_rx) = &mut *channels;
        self.demand.add_permits(1);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NetworkError::ListenerClosed),
            conn = conn_rx.recv() => conn.ok_or(NetworkError::ListenerClosed),
            err = err_rx.recv() => Err(err.unwrap_or(NetworkError::ListenerClosed)),
        }
    }

    /// The bound address, with the real port when `0` was requested.
    pub fn multiaddr(&self) -> Multiaddr {
        self.addr.clone()
    }

    /// Stop accepting and release the bind. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    listener: TcpListener,
    transport: Arc<TcpTransport>,
    conn_tx: mpsc::Sender<UpgradedConn>,
    err_tx: mpsc::Sender<NetworkError>,
    demand: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((raw, addr)) => {
                debug!(addr = %addr, "accepted raw connection");
                tokio::spawn(upgrade_task(
                    transport.clone(),
                    raw,
                    conn_tx.clone(),
                    err_tx.clone(),
                    demand.clone(),
                ));
            }
            Err(e) => {
                let _ = err_tx.send(e.into()).await;
                return;
            }
        }
    }
}

async fn upgrade_task(
    transport: Arc<TcpTransport>,
    raw: TcpStream,
    conn_tx: mpsc::Sender<UpgradedConn>,
    err_tx: mpsc::Sender<NetworkError>,
    demand: Arc<Semaphore>,
) {
    let accept_timeout = transport.options.accept_timeout;
    match upgrade(&transport, raw, None, Direction::Inbound).await {
        Ok(conn) => {
            // Wait for a consumer before handing the connection over.
            let permit = match tokio::time::timeout(accept_timeout, demand.acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                _ => {
                    warn!("upgraded connection not consumed in time, closing it");
                    conn.close().await;
                    return;
                }
            };
            permit.forget();
            if let Err(unconsumed) = conn_tx.send(conn).await {
                // Listener gone; close the fresh connection again.
                unconsumed.0.close().await;
            }
        }
        Err(e) => {
            debug!(error = %e, "inbound upgrade failed");
            let _ = err_tx.send(e).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpTransportOptions;
    use quay_core::Keypair;
    use std::time::Duration;

    fn transport(options: TcpTransportOptions) -> Arc<TcpTransport> {
        Arc::new(TcpTransport::with_options(Keypair::generate(), options))
    }

    fn default_transport() -> Arc<TcpTransport> {
        transport(TcpTransportOptions::default())
    }

    fn listen_addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let server = default_transport();
        let client = default_transport();
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        let addr = listener.multiaddr();
        let (dialed, accepted) = tokio::join!(
            client.dial(&addr, Some(server.noise.local_peer())),
            listener.accept(),
        );
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();

        assert_eq!(dialed.remote_peer(), server.noise.local_peer());
        assert_eq!(accepted.remote_peer(), client.noise.local_peer());
        assert!(!dialed.is_closed());
        assert!(!accepted.is_closed());
    }

    #[tokio::test]
    async fn test_upgraded_streams_carry_data() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = default_transport();
        let client = default_transport();
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        let addr = listener.multiaddr();
        let (dialed, accepted) = tokio::join!(
            client.dial(&addr, None),
            listener.accept(),
        );
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();

        let (mut opened, mut received) =
            tokio::join!(dialed.open_stream(), accepted.accept_stream());
        let opened = opened.as_mut().unwrap();
        let received = received.as_mut().unwrap();

        opened.write_all(b"through the pipeline").await.unwrap();
        opened.flush().await.unwrap();
        let mut buf = [0u8; 20];
        received.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the pipeline");
    }

    #[tokio::test]
    async fn test_bind_error_names_the_address() {
        let transport = default_transport();
        let listener = TcpListenerHandle::bind(transport.clone(), &listen_addr()).await.unwrap();

        let err = TcpListenerHandle::bind(transport.clone(), &listener.multiaddr()).await.unwrap_err();
        match &err {
            NetworkError::Listen { addr, .. } => {
                assert!(err.to_string().contains(&addr.to_string()));
            }
            other => panic!("expected Listen error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_closed_listener_rejects_accept() {
        let transport = default_transport();
        let listener = TcpListenerHandle::bind(transport.clone(), &listen_addr()).await.unwrap();

        listener.close();
        assert!(matches!(
            listener.accept().await,
            Err(NetworkError::ListenerClosed)
        ));
        // Stable on repeat.
        assert!(matches!(
            listener.accept().await,
            Err(NetworkError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_security_mismatch_fails_upgrade() {
        // Both sides agree on a protocol the pipeline cannot actually run.
        let options = TcpTransportOptions {
            security_supported: "/tls/1.3".to_string(),
            ..TcpTransportOptions::default()
        };
        let server = transport(options.clone());
        let client = transport(options);
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        let addr = listener.multiaddr();
        let (dialed, accepted) = tokio::join!(
            client.dial(&addr, None),
            listener.accept(),
        );
        assert!(matches!(
            dialed.unwrap_err(),
            NetworkError::SecurityUnsupported(proto) if proto == "/tls/1.3"
        ));
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_security_no_overlap_fails_upgrade() {
        let server = default_transport();
        let client = transport(TcpTransportOptions {
            security_supported: "/tls/1.3".to_string(),
            ..TcpTransportOptions::default()
        });
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        let addr = listener.multiaddr();
        let (dialed, _accepted) = tokio::join!(
            client.dial(&addr, None),
            listener.accept(),
        );
        match dialed.unwrap_err() {
            NetworkError::UpgradeFailed { stage, source } => {
                assert_eq!(stage, crate::error::UpgradeStage::Security);
                assert!(matches!(*source, NetworkError::NegotiationFailed { .. }));
            }
            other => panic!("expected UpgradeFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_muxer_mismatch_fails_upgrade() {
        let options = TcpTransportOptions {
            muxer_supported: "/mplex/6.7.0".to_string(),
            ..TcpTransportOptions::default()
        };
        let server = transport(options.clone());
        let client = transport(options);
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        let addr = listener.multiaddr();
        let (dialed, accepted) = tokio::join!(
            client.dial(&addr, None),
            listener.accept(),
        );
        assert!(matches!(
            dialed.unwrap_err(),
            NetworkError::MuxerUnsupported(proto) if proto == "/mplex/6.7.0"
        ));
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_early_muxer_negotiation_skips_selection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let options = TcpTransportOptions {
            early_muxer_negotiation: true,
            ..TcpTransportOptions::default()
        };
        let server = transport(options.clone());
        let client = transport(options);
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        let addr = listener.multiaddr();
        let (dialed, accepted) = tokio::join!(
            client.dial(&addr, None),
            listener.accept(),
        );
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();

        // The session works end to end without the third selection round.
        let (mut opened, mut received) =
            tokio::join!(dialed.open_stream(), accepted.accept_stream());
        opened.as_mut().unwrap().write_all(b"ok").await.unwrap();
        opened.as_mut().unwrap().flush().await.unwrap();
        let mut buf = [0u8; 2];
        received.as_mut().unwrap().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_wrong_expected_peer_is_rejected() {
        let server = default_transport();
        let client = default_transport();
        let impostor = Keypair::generate();
        let wrong_peer = quay_core::PeerId::from_public_key(impostor.public());
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        let addr = listener.multiaddr();
        let (dialed, _accepted) = tokio::join!(
            client.dial(&addr, Some(&wrong_peer)),
            listener.accept(),
        );
        assert!(matches!(
            dialed.unwrap_err(),
            NetworkError::PeerIdMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_unconsumed_connection_is_closed() {
        let server = transport(TcpTransportOptions {
            accept_timeout: Duration::from_millis(200),
            ..TcpTransportOptions::default()
        });
        let client = default_transport();
        let listener = TcpListenerHandle::bind(server.clone(), &listen_addr()).await.unwrap();

        // Dial but never call accept on the listener.
        let dialed = client.dial(&listener.multiaddr(), None).await.unwrap();

        let mut waited = Duration::ZERO;
        while !dialed.is_closed() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }
        assert!(dialed.is_closed());
    }
}
