//! Spawning and watching the node process.
//!
//! The node is started with `-f <config> __OwningControllerProcess <pid>`
//! so it exits if this process dies before ownership is transferred to the
//! control connection. Each output stream gets a dedicated reader task:
//! stdout is scanned for the control-port announcement, stderr is forwarded
//! to the log.

use crate::config::NodeConfig;
use crate::error::{Result, TorError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Config directive naming the process whose death the node should follow.
pub(crate) const OWNER_DIRECTIVE: &str = "__OwningControllerProcess";

/// Marker the node prints once its control listener is bound.
const PORT_ANNOUNCEMENT: &str = "Control listener listening on port ";

/// A freshly spawned node, not yet authenticated.
pub struct NodeHandle {
    /// The child process, when the launcher runs a real one.
    pub child: Option<Child>,
    /// Resolves to the announced control port. Dropped without a value if
    /// the process ends first.
    pub control_port: oneshot::Receiver<u16>,
}

impl NodeHandle {
    /// Describe why the port never arrived, using the exit status when one
    /// is observable.
    pub(crate) fn exit_error(&mut self) -> TorError {
        if let Some(child) = &mut self.child {
            if let Ok(Some(status)) = child.try_wait() {
                return TorError::Process(format!("node exited early: {status}"));
            }
        }
        TorError::Process("node ended output without announcing a control port".into())
    }

    /// Kill the process if it is still ours to kill.
    pub(crate) async fn destroy(&mut self) {
        if let Some(child) = &mut self.child {
            if let Err(e) = child.kill().await {
                debug!("kill of abandoned node failed: {e}");
            }
        }
    }
}

/// Starts a node for the bootstrap controller. The seam exists so tests can
/// supply a fake node behind a real socket.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn the node described by `config`.
    async fn launch(&self, config: &NodeConfig) -> Result<NodeHandle>;
}

/// Launches the real node binary.
#[derive(Debug, Default)]
pub struct TorLauncher;

#[async_trait]
impl Launcher for TorLauncher {
    async fn launch(&self, config: &NodeConfig) -> Result<NodeHandle> {
        let layout = config.layout();
        let mut command = Command::new(&config.executable);
        command
            .arg("-f")
            .arg(layout.config_file())
            .arg(OWNER_DIRECTIVE)
            .arg(std::process::id().to_string())
            .current_dir(layout.root())
            .env("HOME", layout.root())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            // Last-resort guard against orphans; the normal paths tear the
            // node down through the control connection.
            .kill_on_drop(true);
        #[cfg(unix)]
        command.env("LD_LIBRARY_PATH", layout.root());

        info!(executable = %config.executable.display(), "starting node");
        let mut child = command
            .spawn()
            .map_err(|e| TorError::Process(format!("cannot spawn {}: {e}", config.executable.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TorError::Process("node stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TorError::Process("node stderr not captured".into()))?;

        let (port_tx, control_port) = oneshot::channel();
        tokio::spawn(scan_stdout(stdout, port_tx));
        tokio::spawn(forward_stderr(stderr));

        Ok(NodeHandle {
            child: Some(child),
            control_port,
        })
    }
}

/// Log every stdout line; signal the port latch once the announcement shows.
async fn scan_stdout(stdout: tokio::process::ChildStdout, port_tx: oneshot::Sender<u16>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut port_tx = Some(port_tx);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tor_warden::node", "{line}");
        if let Some(port) = parse_control_port(&line) {
            if let Some(tx) = port_tx.take() {
                let _ = tx.send(port);
            }
        }
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        error!(target: "tor_warden::node", "{line}");
    }
}

/// Extract the port from the announcement line, which ends with the number
/// followed by a period.
fn parse_control_port(line: &str) -> Option<u16> {
    let idx = line.find(PORT_ANNOUNCEMENT)?;
    let rest = &line[idx + PORT_ANNOUNCEMENT.len()..];
    rest.trim_end().trim_end_matches('.').parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_parsing() {
        let line = "May 01 12:00:00.000 [notice] Control listener listening on port 40429.";
        assert_eq!(parse_control_port(line), Some(40429));
        assert_eq!(parse_control_port("Opened Socks listener on 127.0.0.1:0"), None);
        assert_eq!(
            parse_control_port("Control listener listening on port 9051."),
            Some(9051)
        );
    }

    #[test]
    fn announcement_without_trailing_period() {
        assert_eq!(
            parse_control_port("Control listener listening on port 7001"),
            Some(7001)
        );
    }
}
