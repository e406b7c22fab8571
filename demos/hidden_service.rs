//! Demo: publish a hidden service and wait until it is reachable.
//!
//! Run with: cargo run --example hidden_service -- /path/to/tor

use std::time::Duration;
use tor_warden::{HsVariant, NodeConfig, TorSession};

#[tokio::main]
async fn main() -> tor_warden::Result<()> {
    tracing_subscriber::fmt::init();

    let executable = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/usr/bin/tor".to_string());
    let working_dir = std::env::temp_dir().join("tor-warden-hs-demo");

    let session = TorSession::launch(NodeConfig::new(executable, working_dir)).await?;

    // Persistent: the address is derived from key material under the
    // working directory and survives restarts.
    let handle = session
        .publish_hidden_service("demo", HsVariant::Persistent, 80, 8080)
        .await?;
    println!("Publishing {} -> 127.0.0.1:8080", handle.address());

    println!("Waiting for the network to learn about the service...");
    let record = handle.wait_until_ready(Duration::from_secs(180)).await?;
    println!("{} is reachable.", record.address);

    session.unpublish_hidden_service("demo").await?;
    session.shutdown().await;
    Ok(())
}
