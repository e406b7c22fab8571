//! The session: one supervised node, one control connection.
//!
//! A [`TorSession`] is a cheap-to-clone handle on an authenticated node.
//! It is created either by launching a process ([`TorSession::launch`]) or
//! by attaching to an externally managed node's control port
//! ([`TorSession::attach`]). Hidden-service publication and teardown are
//! serialized through one lock, so a shutdown in progress can never race a
//! publish in progress.

use crate::auth::Authenticator;
use crate::bootstrap::{BootstrapController, BootstrappedNode};
use crate::client::ControlClient;
use crate::config::{NodeConfig, WorkDirLayout};
use crate::conn::EventReceiver;
use crate::error::{Result, TorError};
use crate::events::{EventDispatcher, ReadyCallback, ReadyRegistry, BASE_EVENTS};
use crate::hidden_service::{self, HsEnvironment};
use crate::observer::{polling_observer_factory, ObserverFactory};
use crate::process::Launcher;
use crate::proxy::{ProxyHandle, TorStream};
use crate::types::{HiddenServiceRecord, HsVariant, OnionAddress};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_HOSTNAME_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle on a running node. Clones share the same session.
#[derive(Clone)]
pub struct TorSession {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<SessionState>,
    ready: ReadyRegistry,
    layout: Option<WorkDirLayout>,
    observer_factory: ObserverFactory,
    hostname_timeout: Duration,
}

struct SessionState {
    running: bool,
    client: ControlClient,
    child: Option<Child>,
    socks_port: u16,
    active: Vec<HiddenServiceRecord>,
}

/// A freshly published hidden service: its record plus a signal that fires
/// once the service has been announced to the network.
pub struct ServiceHandle {
    record: HiddenServiceRecord,
    ready: oneshot::Receiver<()>,
}

impl ServiceHandle {
    /// The service's onion address.
    pub fn address(&self) -> &OnionAddress {
        &self.record.address
    }

    /// The full record.
    pub fn record(&self) -> &HiddenServiceRecord {
        &self.record
    }

    /// Wait until the service is reachable from the network, bounded by
    /// `wait`.
    pub async fn wait_until_ready(self, wait: Duration) -> Result<HiddenServiceRecord> {
        match timeout(wait, self.ready).await {
            Ok(Ok(())) => Ok(self.record),
            Ok(Err(_)) => Err(TorError::ConnectionClosed),
            Err(_) => Err(TorError::Timeout("hidden service announcement")),
        }
    }
}

impl TorSession {
    /// Spawn and bootstrap a node per `config`.
    pub async fn launch(config: NodeConfig) -> Result<TorSession> {
        let node = BootstrapController::new(config.clone()).run().await?;
        Self::assemble(
            node,
            Some(config.layout()),
            config.observer_factory.clone(),
            config.hostname_timeout,
        )
        .await
    }

    /// Like [`launch`](Self::launch), with a custom process launcher.
    pub async fn launch_with(config: NodeConfig, launcher: Arc<dyn Launcher>) -> Result<TorSession> {
        let node = BootstrapController::with_launcher(config.clone(), launcher)
            .run()
            .await?;
        Self::assemble(
            node,
            Some(config.layout()),
            config.observer_factory.clone(),
            config.hostname_timeout,
        )
        .await
    }

    /// Attach to an externally managed node's control port.
    ///
    /// With `authenticator: None` the strongest handshake the node
    /// advertises is negotiated. `working_dir` is only needed for
    /// persistent hidden services on a node whose state directory is
    /// reachable from here.
    pub async fn attach(
        addr: SocketAddr,
        authenticator: Option<Authenticator>,
        working_dir: Option<PathBuf>,
    ) -> Result<TorSession> {
        let (mut client, events) = ControlClient::connect(addr).await?;
        let authenticator = match authenticator {
            Some(a) => a,
            None => {
                let info = client.protocol_info().await?;
                Authenticator::negotiate(&info)?
            }
        };
        authenticator.authenticate(&mut client).await?;
        client.set_events(BASE_EVENTS).await?;
        info!(%addr, "attached to external node");

        let node = BootstrappedNode {
            client,
            events,
            child: None,
        };
        Self::assemble(
            node,
            working_dir.map(WorkDirLayout::new),
            polling_observer_factory(),
            DEFAULT_HOSTNAME_TIMEOUT,
        )
        .await
    }

    async fn assemble(
        mut node: BootstrappedNode,
        layout: Option<WorkDirLayout>,
        observer_factory: ObserverFactory,
        hostname_timeout: Duration,
    ) -> Result<TorSession> {
        let socks_port = node.client.socks_port().await?;
        let ready = ReadyRegistry::default();
        EventDispatcher::new(ready.clone()).run(node.events);

        Ok(TorSession {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    running: true,
                    client: node.client,
                    child: node.child,
                    socks_port,
                    active: Vec::new(),
                }),
                ready,
                layout,
                observer_factory,
                hostname_timeout,
            }),
        })
    }

    fn environment(&self) -> HsEnvironment<'_> {
        HsEnvironment {
            layout: self.shared.layout.as_ref(),
            observer_factory: &self.shared.observer_factory,
            hostname_timeout: self.shared.hostname_timeout,
        }
    }

    /// Publish a hidden service accepting connections on `service_port`,
    /// relayed to `127.0.0.1:local_port`.
    pub async fn publish_hidden_service(
        &self,
        name: &str,
        variant: HsVariant,
        service_port: u16,
        local_port: u16,
    ) -> Result<ServiceHandle> {
        let mut state = self.shared.state.lock().await;
        if !state.running {
            return Err(TorError::NotRunning);
        }
        let env = self.environment();
        let record = hidden_service::publish(
            &mut state.client,
            &env,
            name,
            variant,
            service_port,
            local_port,
        )
        .await?;
        state.active.push(record.clone());

        let (ready_tx, ready) = oneshot::channel();
        self.shared.ready.register(
            record.address.as_str(),
            Box::new(move || {
                let _ = ready_tx.send(());
            }),
        );
        Ok(ServiceHandle { record, ready })
    }

    /// Remove a published service. Unknown names are a no-op so shutdown
    /// can sweep everything it remembers without bookkeeping races.
    pub async fn unpublish_hidden_service(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !state.running {
            return Err(TorError::NotRunning);
        }
        self.remove_service(&mut state, name).await
    }

    async fn remove_service(&self, state: &mut SessionState, name: &str) -> Result<()> {
        let Some(index) = state.active.iter().position(|r| r.name == name) else {
            return Ok(());
        };
        let env = self.environment();
        let record = state.active[index].clone();
        hidden_service::unpublish(&mut state.client, &env, &record).await?;
        state.active.remove(index);
        info!(address = %record.address, "hidden service unpublished");
        Ok(())
    }

    /// Register an extra callback fired once `address` has been announced.
    pub fn on_service_ready(&self, address: &OnionAddress, callback: ReadyCallback) {
        self.shared.ready.register(address.as_str(), callback);
    }

    /// A proxy handle for outbound connections, isolated under `stream_id`
    /// when one is given.
    pub async fn proxy(&self, stream_id: Option<&str>) -> Result<ProxyHandle> {
        let state = self.shared.state.lock().await;
        if !state.running {
            return Err(TorError::NotRunning);
        }
        Ok(ProxyHandle::new(state.socks_port, stream_id))
    }

    /// Connect to `host:port` through the node, optionally stream-isolated.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        stream_id: Option<&str>,
    ) -> Result<TorStream> {
        let handle = self.proxy(stream_id).await?;
        TorStream::connect(&handle, host, port).await
    }

    /// Ask for fresh circuits.
    pub async fn new_identity(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !state.running {
            return Err(TorError::NotRunning);
        }
        state.client.signal(crate::types::Signal::NewNym).await
    }

    /// Records of currently published services.
    pub async fn active_services(&self) -> Vec<HiddenServiceRecord> {
        self.shared.state.lock().await.active.clone()
    }

    /// Whether the session is still usable.
    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.running
    }

    /// Tear the session down: unpublish every remembered service, stop the
    /// node, close the connection. Idempotent and best-effort throughout;
    /// failures are logged, never returned.
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        if !state.running {
            return;
        }
        state.running = false;

        let names: Vec<String> = state.active.iter().map(|r| r.name.clone()).collect();
        for name in names {
            if let Err(e) = self.remove_service(&mut state, &name).await {
                warn!(name = %name, "could not unpublish during shutdown: {e}");
            }
        }

        state.client.shutdown_node().await;

        if let Some(mut child) = state.child.take() {
            match timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "node exited"),
                Ok(Err(e)) => warn!("could not observe node exit: {e}"),
                Err(_) => {
                    warn!("node ignored the termination signal, killing it");
                    if let Err(e) = child.kill().await {
                        warn!("kill failed: {e}");
                    }
                }
            }
        }
        info!("session shut down");
    }
}
