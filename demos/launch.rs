//! Demo: launch a node and route a connection through it.
//!
//! Run with: cargo run --example launch -- /path/to/tor

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tor_warden::{NodeConfig, TorSession};

#[tokio::main]
async fn main() -> tor_warden::Result<()> {
    tracing_subscriber::fmt::init();

    let executable = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/usr/bin/tor".to_string());
    let working_dir = std::env::temp_dir().join("tor-warden-demo");

    println!("Launching node from {executable}...");
    let config = NodeConfig::new(executable, working_dir)
        .attempts(3)
        .attempt_timeout(Duration::from_secs(240));
    let session = TorSession::launch(config).await?;
    println!("Node is bootstrapped.");

    let proxy = session.proxy(Some("demo-stream")).await?;
    println!("SOCKS proxy at {} (stream-isolated)", proxy.socks_addr());

    // A quick round trip through the network.
    let mut stream = session.connect("check.torproject.org", 80, None).await?;
    stream
        .write_all(b"GET / HTTP/1.0\r\nHost: check.torproject.org\r\n\r\n")
        .await
        .map_err(tor_warden::TorError::Io)?;
    let mut response = vec![0u8; 512];
    let n = stream
        .read(&mut response)
        .await
        .map_err(tor_warden::TorError::Io)?;
    println!("response head:\n{}", String::from_utf8_lossy(&response[..n]));

    session.shutdown().await;
    Ok(())
}
