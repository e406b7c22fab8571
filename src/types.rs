//! Core domain types.

use crate::error::{Result, TorError};
use crate::protocol::parse_pairs;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// An onion address in the form `<service-id>.onion`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Build from a bare service id (no `.onion` suffix).
    pub fn from_service_id(id: impl AsRef<str>) -> Self {
        OnionAddress(format!("{}.onion", id.as_ref()))
    }

    /// Build from a full hostname, trimming whitespace.
    pub fn from_hostname(hostname: &str) -> Self {
        OnionAddress(hostname.trim().to_string())
    }

    /// The full `x.onion` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The service id without the `.onion` suffix.
    pub fn service_id(&self) -> &str {
        self.0.strip_suffix(".onion").unwrap_or(&self.0)
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `key=value` entry from a GETCONF reply. A key may appear with no
/// value when the option is set to its empty default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    /// Option name as reported by the node.
    pub key: String,
    /// Option value, if any.
    pub value: Option<String>,
}

impl ConfigEntry {
    /// Parse a GETCONF reply line.
    pub fn parse(line: &str) -> Self {
        match line.split_once('=') {
            Some((k, v)) => ConfigEntry {
                key: k.to_string(),
                value: Some(v.to_string()),
            },
            None => ConfigEntry {
                key: line.to_string(),
                value: None,
            },
        }
    }

    /// Render as a `SETCONF` argument.
    pub fn to_directive(&self) -> (String, String) {
        (self.key.clone(), self.value.clone().unwrap_or_default())
    }
}

/// Parsed `status/bootstrap-phase` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPhase {
    /// Progress percentage, 0..=100.
    pub progress: u8,
    /// Short machine tag, e.g. `conn_dir`, `done`.
    pub tag: String,
    /// Human-readable summary.
    pub summary: String,
}

impl BootstrapPhase {
    /// The node considers itself fully bootstrapped.
    pub fn is_done(&self) -> bool {
        self.progress >= 100
    }
}

impl FromStr for BootstrapPhase {
    type Err = TorError;

    /// Accepts the raw value, e.g.
    /// `NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn SUMMARY="Connecting"`.
    fn from_str(s: &str) -> Result<Self> {
        let pairs = parse_pairs(s);
        let progress = pairs
            .get("PROGRESS")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| TorError::Parse(format!("no PROGRESS in bootstrap phase: {s:?}")))?;
        Ok(BootstrapPhase {
            progress,
            tag: pairs.get("TAG").cloned().unwrap_or_default(),
            summary: pairs.get("SUMMARY").cloned().unwrap_or_default(),
        })
    }
}

/// Signals accepted by the SIGNAL command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Reload configuration.
    Reload,
    /// Controlled shutdown.
    Term,
    /// Immediate shutdown.
    Halt,
    /// Switch to new circuits.
    NewNym,
}

impl Signal {
    /// Wire name of the signal.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Reload => "RELOAD",
            Signal::Term => "TERM",
            Signal::Halt => "HALT",
            Signal::NewNym => "NEWNYM",
        }
    }
}

/// Which publication mechanism a hidden service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsVariant {
    /// Created through the dedicated service-creation command; the key lives
    /// in the node's memory and the address is returned immediately.
    Ephemeral,
    /// Installed as directory/port directives in the live configuration; key
    /// material lives in the service directory on disk and survives
    /// restarts.
    Persistent,
}

/// A published hidden service remembered for cleanup.
#[derive(Debug, Clone)]
pub struct HiddenServiceRecord {
    /// Caller-chosen name (also the on-disk directory name for the
    /// persistent variant).
    pub name: String,
    /// The service's onion address.
    pub address: OnionAddress,
    /// Port the service accepts connections on.
    pub service_port: u16,
    /// Local port connections are relayed to.
    pub local_port: u16,
    /// How it was published.
    pub variant: HsVariant,
    /// Service directory, persistent variant only.
    pub directory: Option<PathBuf>,
    /// Private key blob as returned by the node, when one was generated.
    pub private_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onion_address_round_trip() {
        let addr = OnionAddress::from_service_id("abcdef0123456789");
        assert_eq!(addr.as_str(), "abcdef0123456789.onion");
        assert_eq!(addr.service_id(), "abcdef0123456789");

        let trimmed = OnionAddress::from_hostname("  xyz.onion\n");
        assert_eq!(trimmed.as_str(), "xyz.onion");
    }

    #[test]
    fn config_entry_with_and_without_value() {
        let dir = ConfigEntry::parse("HiddenServiceDir=/var/lib/tor/hs");
        assert_eq!(dir.key, "HiddenServiceDir");
        assert_eq!(dir.value.as_deref(), Some("/var/lib/tor/hs"));

        let bare = ConfigEntry::parse("HiddenServiceOptions");
        assert_eq!(bare.key, "HiddenServiceOptions");
        assert!(bare.value.is_none());
    }

    #[test]
    fn bootstrap_phase_parsing() {
        let phase: BootstrapPhase = "NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn \
             SUMMARY=\"Connecting to a relay\""
            .parse()
            .unwrap();
        assert_eq!(phase.progress, 85);
        assert_eq!(phase.tag, "ap_conn");
        assert!(!phase.is_done());

        let done: BootstrapPhase = "NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\""
            .parse()
            .unwrap();
        assert!(done.is_done());
    }

    #[test]
    fn bootstrap_phase_requires_progress() {
        assert!("NOTICE BOOTSTRAP TAG=done".parse::<BootstrapPhase>().is_err());
    }

    #[test]
    fn signal_names() {
        assert_eq!(Signal::Term.as_str(), "TERM");
        assert_eq!(Signal::NewNym.as_str(), "NEWNYM");
    }
}
