//! Command surface of the control protocol.
//!
//! [`ControlClient`] owns a [`ControlConnection`] and speaks the commands
//! this crate needs: authentication, GETINFO/GETCONF/SETCONF/SAVECONF,
//! event subscription, ownership, onion-service creation and teardown, and
//! signals. Replies with non-success status surface as
//! [`TorError::Protocol`]; authentication commands map rejections to
//! [`TorError::Auth`] instead.

use crate::auth::ProtocolInfo;
use crate::conn::{ControlConnection, EventReceiver};
use crate::error::{Result, TorError};
use crate::protocol::{format_command, quote_arg, Reply};
use crate::types::{BootstrapPhase, ConfigEntry, Signal};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

const LOCAL_IP: &str = "127.0.0.1";
const KEY_BOOTSTRAP_PHASE: &str = "status/bootstrap-phase";
const KEY_SOCKS_LISTENERS: &str = "net/listeners/socks";
const CONF_DISABLE_NETWORK: &str = "DisableNetwork";

/// An authenticated-or-authenticating client on one control connection.
pub struct ControlClient {
    conn: ControlConnection,
}

impl ControlClient {
    /// Connect to a control port. Returns the client and the stream of
    /// asynchronous events the connection will produce.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, EventReceiver)> {
        let (conn, events) = ControlConnection::connect(addr).await?;
        Ok((ControlClient { conn }, events))
    }

    /// Wrap an established socket.
    pub fn from_stream(stream: TcpStream) -> (Self, EventReceiver) {
        let (conn, events) = ControlConnection::from_stream(stream);
        (ControlClient { conn }, events)
    }

    /// Send a command and require a success reply.
    async fn command(&mut self, keyword: &str, args: &[&str]) -> Result<Reply> {
        self.conn.send(&format_command(keyword, args)).await?.ok()
    }

    /// `AUTHENTICATE [payload]`. Rejections become [`TorError::Auth`].
    pub async fn authenticate_raw(&mut self, payload: &str) -> Result<()> {
        let command = if payload.is_empty() {
            format_command("AUTHENTICATE", &[])
        } else {
            format_command("AUTHENTICATE", &[payload])
        };
        let reply = self.conn.send(&command).await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(TorError::Auth(format!(
                "credential rejected (status {}): {}",
                reply.status,
                reply.first_line()
            )))
        }
    }

    /// `AUTHCHALLENGE SAFECOOKIE <hex nonce>`.
    pub async fn auth_challenge(&mut self, client_nonce_hex: &str) -> Result<Reply> {
        let reply = self
            .conn
            .send(&format_command(
                "AUTHCHALLENGE",
                &["SAFECOOKIE", client_nonce_hex],
            ))
            .await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(TorError::Auth(format!(
                "AUTHCHALLENGE rejected (status {}): {}",
                reply.status,
                reply.first_line()
            )))
        }
    }

    /// `PROTOCOLINFO 1`.
    pub async fn protocol_info(&mut self) -> Result<ProtocolInfo> {
        let reply = self.command("PROTOCOLINFO", &["1"]).await?;
        Ok(ProtocolInfo::parse(&reply.lines))
    }

    /// `GETINFO <key>`, returning the single value.
    pub async fn get_info(&mut self, key: &str) -> Result<String> {
        let reply = self.command("GETINFO", &[key]).await?;
        if let Some(value) = reply.value_of(key) {
            return Ok(value.to_string());
        }
        // Multi-line values arrive as a data block.
        if let Some(block) = reply.data.first() {
            return Ok(block.clone());
        }
        Err(TorError::Parse(format!("GETINFO {key}: no value in reply")))
    }

    /// `GETCONF <key>`, one entry per reply line.
    pub async fn get_conf(&mut self, key: &str) -> Result<Vec<ConfigEntry>> {
        let reply = self.command("GETCONF", &[key]).await?;
        Ok(reply.lines.iter().map(|l| ConfigEntry::parse(l)).collect())
    }

    /// `SETCONF k=v ...`. Values are quoted as needed; an empty value
    /// clears the option.
    pub async fn set_conf(&mut self, entries: &[(String, String)]) -> Result<()> {
        let args: Vec<String> = entries
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={}", quote_arg(v))
                }
            })
            .collect();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.command("SETCONF", &arg_refs).await?;
        Ok(())
    }

    /// `RESETCONF <keys>`: restore options to their defaults.
    pub async fn reset_conf(&mut self, keys: &[&str]) -> Result<()> {
        self.command("RESETCONF", keys).await?;
        Ok(())
    }

    /// `SAVECONF`: persist the live configuration to the config file.
    pub async fn save_conf(&mut self) -> Result<()> {
        self.command("SAVECONF", &[]).await?;
        Ok(())
    }

    /// `SETEVENTS <names>`: replace the event subscription set.
    pub async fn set_events(&mut self, names: &[&str]) -> Result<()> {
        self.command("SETEVENTS", names).await?;
        Ok(())
    }

    /// `TAKEOWNERSHIP`: the node exits when this connection closes.
    pub async fn take_ownership(&mut self) -> Result<()> {
        self.command("TAKEOWNERSHIP", &[]).await?;
        Ok(())
    }

    /// `SIGNAL <sig>`.
    pub async fn signal(&mut self, signal: Signal) -> Result<()> {
        self.command("SIGNAL", &[signal.as_str()]).await?;
        Ok(())
    }

    /// `ADD_ONION`: create a hidden service held in the node's memory.
    /// Returns the service id and, when the node generated one, the private
    /// key blob.
    pub async fn add_onion(
        &mut self,
        service_port: u16,
        local_port: u16,
        key: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        let key_spec = key.unwrap_or("NEW:BEST").to_string();
        let port_spec = format!("Port={service_port},{LOCAL_IP}:{local_port}");
        let reply = self.command("ADD_ONION", &[&key_spec, &port_spec]).await?;

        let service_id = reply
            .value_of("ServiceID")
            .map(str::to_string)
            .ok_or_else(|| TorError::Parse("ADD_ONION reply without ServiceID".into()))?;
        let private_key = reply.value_of("PrivateKey").map(str::to_string);
        Ok((service_id, private_key))
    }

    /// `DEL_ONION <service id>`.
    pub async fn del_onion(&mut self, service_id: &str) -> Result<()> {
        self.command("DEL_ONION", &[service_id]).await?;
        Ok(())
    }

    /// Allow the node to touch the network.
    pub async fn enable_network(&mut self) -> Result<()> {
        self.set_conf(&[(CONF_DISABLE_NETWORK.into(), "0".into())])
            .await
    }

    /// Cut the node off from the network.
    pub async fn disable_network(&mut self) -> Result<()> {
        self.set_conf(&[(CONF_DISABLE_NETWORK.into(), "1".into())])
            .await
    }

    /// Current bootstrap progress.
    pub async fn bootstrap_phase(&mut self) -> Result<BootstrapPhase> {
        self.get_info(KEY_BOOTSTRAP_PHASE).await?.parse()
    }

    /// The local SOCKS listener port. The reply is a space-separated list
    /// of quoted listener addresses which may mix IPv4, IPv6 and unix
    /// sockets; only the IPv4 loopback binding is usable here.
    pub async fn socks_port(&mut self) -> Result<u16> {
        let listeners = self.get_info(KEY_SOCKS_LISTENERS).await?;
        parse_socks_port(&listeners)
    }

    /// Best-effort node teardown: disable the network, ask for a controlled
    /// exit. Errors are logged, never returned; this runs on shutdown
    /// paths that must not fail.
    pub async fn shutdown_node(&mut self) {
        if let Err(e) = self.disable_network().await {
            debug!("disable-network during shutdown failed: {e}");
        }
        if let Err(e) = self.signal(Signal::Term).await {
            debug!("TERM signal during shutdown failed: {e}");
        }
    }
}

fn parse_socks_port(listeners: &str) -> Result<u16> {
    let local_fragment = format!("\"{LOCAL_IP}:");
    for entry in listeners.split_whitespace() {
        if !entry.contains(&local_fragment) {
            continue;
        }
        let trimmed = entry.trim_matches('"');
        if let Some(port) = trimmed
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        {
            return Ok(port);
        }
    }
    Err(TorError::Parse(format!(
        "no IPv4 loopback SOCKS listener in {listeners:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks_listener_parsing() {
        assert_eq!(parse_socks_port("\"127.0.0.1:9050\"").unwrap(), 9050);
        assert_eq!(
            parse_socks_port("\"[::1]:9999\" \"127.0.0.1:19050\"").unwrap(),
            19050
        );
        assert!(parse_socks_port("\"unix:/run/tor/socks\"").is_err());
        assert!(parse_socks_port("").is_err());
    }
}
