//! # tor-warden
//!
//! Run an external Tor daemon as a managed network endpoint.
//!
//! This crate supervises a node binary over its control port: it spawns the
//! process, authenticates, drives it through bootstrap with retries,
//! publishes and tears down hidden services, and produces outbound
//! connections routed through the node's SOCKS proxy with optional
//! per-connection stream isolation.
//!
//! ## Launching a node
//!
//! ```rust,no_run
//! use tor_warden::{NodeConfig, TorSession};
//!
//! #[tokio::main]
//! async fn main() -> tor_warden::Result<()> {
//!     let config = NodeConfig::new("/usr/bin/tor", "/var/lib/my-app/tor");
//!     let session = TorSession::launch(config).await?;
//!
//!     // Outbound connection through the node, isolated from other streams.
//!     let stream = session
//!         .connect("example3pwrip6qxm.onion", 80, Some("my-stream"))
//!         .await?;
//!     drop(stream);
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Publishing a hidden service
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tor_warden::{HsVariant, NodeConfig, TorSession};
//!
//! # async fn example() -> tor_warden::Result<()> {
//! let session = TorSession::launch(NodeConfig::new("/usr/bin/tor", "/tmp/node")).await?;
//!
//! // Persistent: key material lives under the working directory and the
//! // address survives restarts.
//! let handle = session
//!     .publish_hidden_service("web", HsVariant::Persistent, 80, 8080)
//!     .await?;
//! println!("serving at {}", handle.address());
//!
//! // Block until the network can actually reach it.
//! let record = handle.wait_until_ready(Duration::from_secs(120)).await?;
//! # let _ = record;
//! # Ok(())
//! # }
//! ```
//!
//! ## Attaching to an already-running node
//!
//! ```rust,no_run
//! use tor_warden::{Authenticator, TorSession};
//!
//! # async fn example() -> tor_warden::Result<()> {
//! let session = TorSession::attach(
//!     "127.0.0.1:9051".parse().unwrap(),
//!     Some(Authenticator::SafeCookie("/run/tor/control.authcookie".into())),
//!     None,
//! )
//! .await?;
//! # let _ = session;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `test-utils`: mock control-port server and launcher for downstream
//!   test suites.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod auth;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod observer;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod types;

mod hidden_service;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use auth::{Authenticator, ProtocolInfo};
pub use bootstrap::{BootstrapController, BootstrapState};
pub use client::ControlClient;
pub use config::{NodeConfig, WorkDirLayout};
pub use error::{Result, TorError};
pub use events::{ReadyCallback, ReadyRegistry};
pub use observer::{HashPollObserver, ObserverFactory, WriteObserver};
pub use process::{Launcher, TorLauncher};
pub use proxy::{isolation_credential, ProxyHandle, TorStream};
pub use session::{ServiceHandle, TorSession};
pub use types::{
    BootstrapPhase, ConfigEntry, HiddenServiceRecord, HsVariant, OnionAddress, Signal,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
