//! Test doubles for code built on this crate.
//!
//! [`MockControlServer`] speaks enough of the control protocol to exercise
//! every flow in the crate without a real node: all four authentication
//! handshakes, configuration state for hidden-service directives, scripted
//! bootstrap progress, onion creation, and event injection.
//! [`MockLauncher`] plugs it into the bootstrap controller as a fake node
//! process.
//!
//! Enable with the `test-utils` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tor-warden = { version = "0.2", features = ["test-utils"] }
//! ```

use crate::config::NodeConfig;
use crate::error::{Result, TorError};
use crate::process::{Launcher, NodeHandle};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

type HmacSha256 = Hmac<Sha256>;

/// Behavior knobs for the mock server.
#[derive(Clone, Default)]
pub struct MockOptions {
    /// Accept any AUTHENTICATE payload.
    pub accept_any_auth: bool,
    /// Expected cookie bytes for COOKIE / SAFECOOKIE handshakes.
    pub cookie: Option<Vec<u8>>,
    /// Expected password for the password handshake.
    pub password: Option<String>,
    /// Advertise and accept the NULL handshake.
    pub allow_null: bool,
    /// Present a deliberately wrong SAFECOOKIE server hash.
    pub corrupt_server_hash: bool,
    /// Successive bootstrap percentages; the last repeats forever.
    pub bootstrap_progress: Vec<u8>,
    /// Port reported as the SOCKS listener.
    pub socks_port: u16,
    /// Called with each received command after state is updated and before
    /// the reply is written.
    pub on_command: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl MockOptions {
    /// Options for a server that lets everything through and reports an
    /// immediately bootstrapped node.
    pub fn permissive() -> Self {
        MockOptions {
            accept_any_auth: true,
            allow_null: true,
            bootstrap_progress: vec![100],
            socks_port: 9050,
            ..Default::default()
        }
    }
}

/// Observable state accumulated by the server.
#[derive(Default)]
pub struct MockState {
    /// Every command line received, verbatim.
    pub commands: Vec<String>,
    /// Live `HiddenServiceDir`/`HiddenServicePort` directive pairs.
    pub hs_directives: Vec<(String, String)>,
    /// Whether AUTHENTICATE has succeeded on some connection.
    pub authenticated: bool,
    /// Times SAVECONF was received.
    pub saveconf_count: u32,
    /// Service ids removed via DEL_ONION.
    pub deleted_onions: Vec<String>,
    /// Current value of the network-disable flag.
    pub network_disabled: bool,
    progress_index: usize,
    onion_counter: u32,
    pending_challenge: Option<PendingChallenge>,
}

struct PendingChallenge {
    expected_payload: String,
}

impl MockState {
    /// Commands starting with `prefix`.
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// A control-port server for tests.
pub struct MockControlServer {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<String>,
    accept_task: JoinHandle<()>,
}

impl MockControlServer {
    /// Bind on an ephemeral port and start serving.
    pub async fn start(options: MockOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState::default()));
        let (events, _) = broadcast::channel(64);

        let accept_state = state.clone();
        let accept_events = events.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(
                    stream,
                    options.clone(),
                    accept_state.clone(),
                    accept_events.subscribe(),
                ));
            }
        });

        Ok(MockControlServer {
            addr,
            state,
            events,
            accept_task,
        })
    }

    /// Address clients should connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port of the listener.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Push a raw asynchronous event line, e.g.
    /// `650 HS_DESC UPLOADED <id> ...`, to every connected client.
    pub fn emit_event(&self, line: &str) {
        let _ = self.events.send(line.to_string());
    }

    /// Run `f` with the accumulated state.
    pub fn with_state<R>(&self, f: impl FnOnce(&MockState) -> R) -> R {
        f(&self.state.lock().expect("mock state poisoned"))
    }
}

impl Drop for MockControlServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    options: MockOptions,
    state: Arc<Mutex<MockState>>,
    mut events: broadcast::Receiver<String>,
) {
    let (read_half, mut writer) = stream.into_split();

    // One writer task owns the socket's write half; command replies and
    // injected events are funneled through it so they never interleave
    // mid-line.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if writer.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
        }
    });

    let event_out = out_tx.clone();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event_out.send(format!("{event}\r\n")).is_err() {
                return;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let command = line.trim_end_matches(['\r', '\n']).to_string();
        let response = {
            let mut state = state.lock().expect("mock state poisoned");
            state.commands.push(command.clone());
            respond(&command, &options, &mut state)
        };
        if let Some(hook) = &options.on_command {
            hook(&command);
        }
        if out_tx.send(response).is_err() {
            break;
        }
    }
    event_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
}

fn respond(command: &str, options: &MockOptions, state: &mut MockState) -> String {
    let mut words = command.split_whitespace();
    let keyword = words.next().unwrap_or("").to_uppercase();
    let rest = command[keyword.len().min(command.len())..].trim_start();
    match keyword.as_str() {
        "AUTHENTICATE" => respond_authenticate(rest, options, state),
        "AUTHCHALLENGE" => respond_authchallenge(rest, options, state),
        "PROTOCOLINFO" => respond_protocolinfo(options),
        "GETINFO" => respond_getinfo(rest, options, state),
        "GETCONF" => respond_getconf(rest, state),
        "SETCONF" => respond_setconf(rest, state),
        "RESETCONF" => {
            if rest.contains("HiddenServiceDir") {
                state.hs_directives.clear();
            }
            ok()
        }
        "SAVECONF" => {
            state.saveconf_count += 1;
            ok()
        }
        "SETEVENTS" | "TAKEOWNERSHIP" | "SIGNAL" => ok(),
        "ADD_ONION" => {
            state.onion_counter += 1;
            let id = format!("mockonion{:04}abcdefghijklmnopqrstuvwxyz234567", state.onion_counter);
            let mut reply = format!("250-ServiceID={id}\r\n");
            if rest.starts_with("NEW:") {
                reply.push_str("250-PrivateKey=ED25519-V3:bW9ja2tleQ==\r\n");
            }
            reply.push_str("250 OK\r\n");
            reply
        }
        "DEL_ONION" => {
            state.deleted_onions.push(rest.to_string());
            ok()
        }
        "QUIT" => ok(),
        _ => "510 Unrecognized command\r\n".to_string(),
    }
}

fn ok() -> String {
    "250 OK\r\n".to_string()
}

fn auth_failed() -> String {
    "515 Authentication failed\r\n".to_string()
}

fn respond_authenticate(payload: &str, options: &MockOptions, state: &mut MockState) -> String {
    let accepted = if options.accept_any_auth {
        true
    } else if let Some(pending) = state.pending_challenge.take() {
        payload.eq_ignore_ascii_case(&pending.expected_payload)
    } else if let Some(password) = &options.password {
        payload == format!("\"{password}\"") || payload == *password
    } else if let Some(cookie) = &options.cookie {
        payload.eq_ignore_ascii_case(&hex::encode(cookie))
    } else {
        options.allow_null && payload.is_empty()
    };
    if accepted {
        state.authenticated = true;
        ok()
    } else {
        auth_failed()
    }
}

fn respond_authchallenge(rest: &str, options: &MockOptions, state: &mut MockState) -> String {
    let Some(cookie) = &options.cookie else {
        return auth_failed();
    };
    let client_nonce = match rest
        .split_whitespace()
        .nth(1)
        .and_then(|hex_nonce| hex::decode(hex_nonce).ok())
    {
        Some(nonce) => nonce,
        None => return "512 Invalid nonce\r\n".to_string(),
    };
    let server_nonce: [u8; 32] = {
        use rand::Rng;
        let mut nonce = [0u8; 32];
        rand::rng().fill(&mut nonce);
        nonce
    };

    // Computed from the protocol's literal key strings, independently of
    // the crate's own helpers, so the tests verify bytes rather than
    // symmetry.
    let mut server_hash = hmac_digest(
        b"Tor safe cookie authentication server-to-controller hash",
        cookie,
        &client_nonce,
        &server_nonce,
    );
    if options.corrupt_server_hash {
        server_hash[0] ^= 0xFF;
    }
    let expected_payload = hex::encode_upper(hmac_digest(
        b"Tor safe cookie authentication controller-to-server hash",
        cookie,
        &client_nonce,
        &server_nonce,
    ));
    state.pending_challenge = Some(PendingChallenge { expected_payload });

    format!(
        "250 AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}\r\n",
        hex::encode_upper(server_hash),
        hex::encode_upper(server_nonce),
    )
}

fn hmac_digest(key: &[u8], cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("any key length is valid for HMAC");
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    mac.finalize().into_bytes().into()
}

fn respond_protocolinfo(options: &MockOptions) -> String {
    let mut methods = Vec::new();
    if options.allow_null || options.accept_any_auth {
        methods.push("NULL");
    }
    if options.password.is_some() {
        methods.push("HASHEDPASSWORD");
    }
    if options.cookie.is_some() {
        methods.push("COOKIE");
        methods.push("SAFECOOKIE");
    }
    let mut reply = String::from("250-PROTOCOLINFO 1\r\n");
    reply.push_str(&format!("250-AUTH METHODS={}", methods.join(",")));
    if options.cookie.is_some() {
        reply.push_str(" COOKIEFILE=\"/mock/control_auth_cookie\"");
    }
    reply.push_str("\r\n250-VERSION Tor=\"0.4.8.12\"\r\n250 OK\r\n");
    reply
}

fn respond_getinfo(rest: &str, options: &MockOptions, state: &mut MockState) -> String {
    match rest {
        "status/bootstrap-phase" => {
            let progress = options
                .bootstrap_progress
                .get(state.progress_index)
                .or(options.bootstrap_progress.last())
                .copied()
                .unwrap_or(0);
            if state.progress_index < options.bootstrap_progress.len() {
                state.progress_index += 1;
            }
            format!(
                "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS={progress} \
                 TAG=mock SUMMARY=\"Mock bootstrap\"\r\n250 OK\r\n"
            )
        }
        "net/listeners/socks" => format!(
            "250-net/listeners/socks=\"127.0.0.1:{}\"\r\n250 OK\r\n",
            options.socks_port
        ),
        "version" => "250-version=0.4.8.12\r\n250 OK\r\n".to_string(),
        other => format!("552 Unrecognized key \"{other}\"\r\n"),
    }
}

fn respond_getconf(key: &str, state: &MockState) -> String {
    match key {
        "HiddenServiceOptions" => {
            if state.hs_directives.is_empty() {
                return "250 HiddenServiceOptions\r\n".to_string();
            }
            let mut reply = String::new();
            for (i, (k, v)) in state.hs_directives.iter().enumerate() {
                let sep = if i + 1 == state.hs_directives.len() {
                    ' '
                } else {
                    '-'
                };
                reply.push_str(&format!("250{sep}{k}={v}\r\n"));
            }
            reply
        }
        "DisableNetwork" => format!(
            "250 DisableNetwork={}\r\n",
            if state.network_disabled { 1 } else { 0 }
        ),
        other => format!("250 {other}\r\n"),
    }
}

fn respond_setconf(rest: &str, state: &mut MockState) -> String {
    let args = split_args(rest);
    let hs_args: Vec<(String, String)> = args
        .iter()
        .filter_map(|arg| arg.split_once('='))
        .filter(|(k, _)| k.starts_with("HiddenService"))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    // SETCONF replaces the whole group of any option it names.
    if !hs_args.is_empty() {
        state.hs_directives = hs_args;
    }
    for arg in &args {
        if let Some((key, value)) = arg.split_once('=') {
            if key == "DisableNetwork" {
                state.network_disabled = value == "1";
            }
        }
    }
    ok()
}

/// Split command arguments, honoring QuotedStrings. The quotes are removed
/// from the returned tokens.
pub fn split_args(rest: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escape = false;
    for c in rest.chars() {
        if escape {
            current.push(c);
            escape = false;
        } else if quoted && c == '\\' {
            escape = true;
        } else if c == '"' {
            quoted = !quoted;
        } else if c == ' ' && !quoted {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Launch behavior for one attempt.
enum LaunchPlan {
    /// Server comes up, cookie gets written, port is announced.
    Healthy,
    /// The "process" dies before announcing a port.
    DiesEarly,
}

/// A [`Launcher`] that runs a [`MockControlServer`] instead of a process.
pub struct MockLauncher {
    options: MockOptions,
    cookie: Vec<u8>,
    fail_first: u32,
    launches: AtomicU32,
    servers: Mutex<Vec<MockControlServer>>,
}

impl MockLauncher {
    /// Every attempt succeeds.
    pub fn healthy(options: MockOptions, cookie: Vec<u8>) -> Self {
        Self::failing_first(options, cookie, 0)
    }

    /// The first `fail_first` attempts die before announcing a port.
    pub fn failing_first(options: MockOptions, cookie: Vec<u8>, fail_first: u32) -> Self {
        MockLauncher {
            options,
            cookie,
            fail_first,
            launches: AtomicU32::new(0),
            servers: Mutex::new(Vec::new()),
        }
    }

    /// How many times `launch` was called.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Inspect the server backing the most recent launch.
    pub fn with_last_server<R>(&self, f: impl FnOnce(&MockControlServer) -> R) -> Option<R> {
        let servers = self.servers.lock().expect("server list poisoned");
        servers.last().map(f)
    }

    /// Inject an event on the most recent server.
    pub fn emit_event(&self, line: &str) {
        let servers = self.servers.lock().expect("server list poisoned");
        if let Some(server) = servers.last() {
            server.emit_event(line);
        }
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, config: &NodeConfig) -> Result<NodeHandle> {
        let attempt = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = if attempt <= self.fail_first {
            LaunchPlan::DiesEarly
        } else {
            LaunchPlan::Healthy
        };

        let layout = config.layout();
        let cookie_file = layout.cookie_file();
        if let Some(parent) = cookie_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (port_tx, control_port) = oneshot::channel();
        match plan {
            LaunchPlan::Healthy => {
                let server = MockControlServer::start(self.options.clone()).await?;
                // The real node writes the cookie once the listener is up.
                tokio::fs::write(&cookie_file, &self.cookie).await?;
                port_tx
                    .send(server.port())
                    .map_err(|_| TorError::Process("bootstrap gave up before launch".into()))?;
                self.servers
                    .lock()
                    .expect("server list poisoned")
                    .push(server);
            }
            LaunchPlan::DiesEarly => {
                // Cookie appears, then the process dies: the port latch
                // sender is dropped without a value.
                tokio::fs::write(&cookie_file, &self.cookie).await?;
                drop(port_tx);
            }
        }

        Ok(NodeHandle {
            child: None,
            control_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_splitting_honors_quotes() {
        let args = split_args(r#"HiddenServiceDir=/w/hs/a HiddenServicePort="80 127.0.0.1:8080""#);
        assert_eq!(args.len(), 2);
        assert_eq!(args[1], "HiddenServicePort=80 127.0.0.1:8080");
    }

    #[test]
    fn setconf_replaces_hidden_service_group() {
        let mut state = MockState::default();
        respond_setconf(
            r#"HiddenServiceDir=/a HiddenServicePort="80 127.0.0.1:8080""#,
            &mut state,
        );
        assert_eq!(state.hs_directives.len(), 2);
        respond_setconf(r#"HiddenServiceDir=/b HiddenServicePort="81 127.0.0.1:8081""#, &mut state);
        assert_eq!(state.hs_directives[0].1, "/b");
        respond_setconf("DisableNetwork=1", &mut state);
        assert!(state.network_disabled);
        assert_eq!(state.hs_directives.len(), 2);
    }

    #[test]
    fn getconf_renders_directive_pairs() {
        let mut state = MockState::default();
        state
            .hs_directives
            .push(("HiddenServiceDir".into(), "/a".into()));
        state
            .hs_directives
            .push(("HiddenServicePort".into(), "80 127.0.0.1:8080".into()));
        let reply = respond_getconf("HiddenServiceOptions", &state);
        assert_eq!(
            reply,
            "250-HiddenServiceDir=/a\r\n250 HiddenServicePort=80 127.0.0.1:8080\r\n"
        );
    }
}
