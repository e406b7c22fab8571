//! Error types for tor-warden.
//!
//! One crate-wide error enum covers everything that can go wrong between
//! spawning the node and tearing the session down. The bootstrap controller
//! catches and retries most of these internally; see the variant docs for
//! what actually reaches callers.

use std::io;
use thiserror::Error;

/// The error type for all tor-warden operations.
#[derive(Error, Debug)]
pub enum TorError {
    /// I/O error during process or socket handling.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unsupported node configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The control port answered with a non-success status line.
    #[error("control protocol error (status {code}): {message}")]
    Protocol {
        /// The 3-digit status code from the reply.
        code: u16,
        /// The raw reply text.
        message: String,
    },

    /// Credential rejected, or the SAFECOOKIE server hash did not verify.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A bounded wait (cookie file, hostname file, bootstrap) expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A hidden service with the same on-disk directory is already published.
    #[error("hidden service conflict: {0}")]
    Conflict(String),

    /// The spawned node process failed before handing over control.
    #[error("node process error: {0}")]
    Process(String),

    /// Every bootstrap attempt was exhausted without reaching the network.
    #[error("could not bootstrap the node after {attempts} attempts")]
    Bootstrap {
        /// How many launch attempts were made.
        attempts: u32,
    },

    /// Operation attempted on a session that has already been shut down.
    #[error("session is no longer running")]
    NotRunning,

    /// The control connection dropped mid-conversation.
    #[error("control connection closed unexpectedly")]
    ConnectionClosed,

    /// A reply or event could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TorError>;

impl TorError {
    /// Whether this error aborts a single bootstrap attempt rather than the
    /// whole setup. The bootstrap controller retries these; everything else
    /// (notably `Config`) is permanent.
    pub(crate) fn is_attempt_scoped(&self) -> bool {
        !matches!(self, TorError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_permanent() {
        assert!(!TorError::Config("bad".into()).is_attempt_scoped());
        assert!(TorError::Timeout("cookie file").is_attempt_scoped());
        assert!(TorError::Auth("rejected".into()).is_attempt_scoped());
    }

    #[test]
    fn display_carries_status_code() {
        let err = TorError::Protocol {
            code: 515,
            message: "Bad authentication".into(),
        };
        let text = err.to_string();
        assert!(text.contains("515"));
        assert!(text.contains("Bad authentication"));
    }
}
