//! Demo: attach to an already-running node's control port.
//!
//! Run with: cargo run --example attach
//!
//! Expects a node with its control port on 127.0.0.1:9051. Set
//! TOR_CONTROL_PORT to override.

use tor_warden::TorSession;

#[tokio::main]
async fn main() -> tor_warden::Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::var("TOR_CONTROL_PORT")
        .unwrap_or_else(|_| "127.0.0.1:9051".to_string())
        .parse()
        .expect("TOR_CONTROL_PORT must be host:port");

    // No authenticator given: the strongest advertised handshake is used.
    let session = TorSession::attach(addr, None, None).await?;
    println!("Attached; node is running: {}", session.is_running().await);

    let proxy = session.proxy(None).await?;
    println!("SOCKS proxy at {}", proxy.socks_addr());

    session.new_identity().await?;
    println!("Requested fresh circuits.");

    session.shutdown().await;
    Ok(())
}
