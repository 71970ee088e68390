//! Two in-process hosts talking over a negotiated echo protocol.
//!
//! Run with: cargo run --example echo

use quay_core::Keypair;
use quay_network::NetworkResult;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

const ECHO_PROTOCOL: &str = "/echo/1.0.0";

#[tokio::main]
async fn main() -> NetworkResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let listen = vec!["/ip4/127.0.0.1/tcp/0".parse()?];

    let server = quay_network::new(vec![
        quay_network::identity(Keypair::generate()),
        quay_network::listen_addrs(listen.clone()),
    ])
    .await?;

    let client = quay_network::new(vec![
        quay_network::identity(Keypair::generate()),
        quay_network::listen_addrs(listen),
    ])
    .await?;

    server.set_stream_handler(ECHO_PROTOCOL, |mut stream| async move {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = stream.close().await;
    });

    info!(server = %server.id(), addrs = ?server.addrs(), "server up");

    client.connect(&server.addr_info()).await?;
    let mut stream = client
        .new_stream(server.id(), &[ECHO_PROTOCOL.to_string()])
        .await?;

    stream.write_all(b"hello, quay").await?;
    stream.flush().await?;

    let mut reply = [0u8; 11];
    stream.read_exact(&mut reply).await?;
    info!(reply = %String::from_utf8_lossy(&reply), "echo came back");

    stream.close().await?;
    client.close().await;
    server.close().await;
    Ok(())
}
