//! Launching the node until the network is reachable.
//!
//! One [`BootstrapController`] run makes up to `attempts` tries. A try
//! spawns the process, waits for the auth cookie, authenticates over the
//! announced control port, takes ownership, enables the network, and polls
//! bootstrap progress until 100%, all under one deadline. A failed try
//! clears the working directory (except hidden-service key material, and
//! never before the first try: a warm cache usually boots faster) and the
//! next one starts from scratch.

use crate::auth;
use crate::client::ControlClient;
use crate::config::{NodeConfig, WorkDirLayout};
use crate::conn::EventReceiver;
use crate::error::{Result, TorError};
use crate::events::BASE_EVENTS;
use crate::observer::WriteObserver;
use crate::process::{Launcher, NodeHandle, TorLauncher, OWNER_DIRECTIVE};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Where a single bootstrap attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Process spawned, nothing observed yet.
    Starting,
    /// Waiting for the node to write its auth cookie.
    WaitingForCookie,
    /// Control port known, running the handshake.
    Authenticating,
    /// Authenticated; network still disabled.
    NetworkDisabled,
    /// Network enabled, progress at the given percentage.
    Bootstrapping(u8),
    /// The node reports full reachability.
    Bootstrapped,
    /// The attempt is over and failed.
    Failed,
}

/// Everything a successful bootstrap hands to the session.
pub struct BootstrappedNode {
    /// Authenticated, owning control client.
    pub client: ControlClient,
    /// Event stream of the connection.
    pub events: EventReceiver,
    /// The supervised process, if a real one was spawned.
    pub child: Option<Child>,
}

/// Supervises the launch-authenticate-bootstrap cycle with retries.
pub struct BootstrapController {
    config: NodeConfig,
    launcher: Arc<dyn Launcher>,
}

impl BootstrapController {
    /// Controller for the real node binary.
    pub fn new(config: NodeConfig) -> Self {
        Self::with_launcher(config, Arc::new(TorLauncher))
    }

    /// Controller with a custom process launcher.
    pub fn with_launcher(config: NodeConfig, launcher: Arc<dyn Launcher>) -> Self {
        BootstrapController { config, launcher }
    }

    /// Run attempts until one bootstraps or all are spent.
    pub async fn run(&self) -> Result<BootstrappedNode> {
        let layout = self.config.layout();
        for attempt in 1..=self.config.attempts {
            info!(attempt, of = self.config.attempts, "bootstrapping node");
            match timeout(self.config.attempt_timeout, self.attempt(&layout)).await {
                Ok(Ok(node)) => {
                    info!(attempt, "node bootstrapped");
                    return Ok(node);
                }
                Ok(Err(e)) if !e.is_attempt_scoped() => return Err(e),
                Ok(Err(e)) => warn!(attempt, error = %e, "bootstrap attempt failed"),
                // The dropped attempt future has already torn the spawned
                // process down on its way out.
                Err(_) => warn!(attempt, "bootstrap attempt hit its deadline"),
            }
            self.note(BootstrapState::Failed);
            // Cached descriptors can poison every following attempt.
            if let Err(e) = layout.clear_all_but_hidden_services().await {
                warn!("could not clear working directory: {e}");
            }
        }
        Err(TorError::Bootstrap {
            attempts: self.config.attempts,
        })
    }

    async fn attempt(&self, layout: &WorkDirLayout) -> Result<BootstrappedNode> {
        self.note(BootstrapState::Starting);
        layout.prepare(&self.config.render_config()).await?;
        let mut observer = (self.config.observer_factory)(&layout.cookie_file())?;
        let mut handle = self.launcher.launch(&self.config).await?;

        match self.drive(&mut handle, observer.as_mut(), layout).await {
            Ok((client, events)) => Ok(BootstrappedNode {
                client,
                events,
                child: handle.child.take(),
            }),
            Err(e) => {
                handle.destroy().await;
                Err(e)
            }
        }
    }

    /// One attempt from spawned process to bootstrapped client. The caller
    /// bounds this with the attempt deadline and owns process cleanup.
    async fn drive(
        &self,
        handle: &mut NodeHandle,
        observer: &mut dyn WriteObserver,
        layout: &WorkDirLayout,
    ) -> Result<(ControlClient, EventReceiver)> {
        self.note(BootstrapState::WaitingForCookie);
        if !observer.poll(self.config.cookie_timeout).await? {
            return Err(TorError::Timeout("auth cookie file"));
        }

        let port = match (&mut handle.control_port).await {
            Ok(port) => port,
            Err(_) => return Err(handle.exit_error()),
        };
        debug!(port, "control listener announced");

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let (mut client, events) = ControlClient::connect(addr).await?;

        self.note(BootstrapState::Authenticating);
        let cookie = read_cookie_settled(&layout.cookie_file()).await?;
        client.authenticate_raw(&hex::encode_upper(cookie)).await?;

        // From here the node follows this connection's lifetime instead of
        // the launching process's.
        client.take_ownership().await?;
        client.reset_conf(&[OWNER_DIRECTIVE]).await?;
        client.set_events(BASE_EVENTS).await?;

        self.note(BootstrapState::NetworkDisabled);
        client.enable_network().await?;

        loop {
            let phase = client.bootstrap_phase().await?;
            self.note(BootstrapState::Bootstrapping(phase.progress));
            if phase.is_done() {
                break;
            }
            sleep(self.config.bootstrap_poll).await;
        }

        self.note(BootstrapState::Bootstrapped);
        Ok((client, events))
    }

    fn note(&self, state: BootstrapState) {
        debug!(?state, "bootstrap state");
    }
}

/// The cookie file flips from the empty placeholder to 32 secret bytes at
/// some point after the listener comes up; reads in between see a torn
/// state. Retry briefly instead of failing the attempt.
async fn read_cookie_settled(path: &Path) -> Result<Vec<u8>> {
    const SETTLE_ROUNDS: u32 = 40;
    for _ in 0..SETTLE_ROUNDS {
        if let Ok(cookie) = auth::read_cookie(path) {
            return Ok(cookie);
        }
        sleep(Duration::from_millis(50)).await;
    }
    auth::read_cookie(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cookie_read_waits_for_full_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        std::fs::write(&path, b"").unwrap();

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(150)).await;
                std::fs::write(&path, vec![0xA1u8; 32]).unwrap();
            })
        };

        let cookie = read_cookie_settled(&path).await.unwrap();
        assert_eq!(cookie, vec![0xA1u8; 32]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn cookie_read_gives_up_eventually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        std::fs::write(&path, b"too short").unwrap();
        assert!(read_cookie_settled(&path).await.is_err());
    }
}
