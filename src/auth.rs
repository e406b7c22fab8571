//! Control-port authentication.
//!
//! Four handshakes are supported: NULL, password, cookie, and SAFECOOKIE.
//! The SAFECOOKIE exchange proves the node can read the same cookie file as
//! the client before any secret-derived material is sent, which defeats a
//! fake listener that only controls the port.

use crate::client::ControlClient;
use crate::error::{Result, TorError};
use crate::protocol::{parse_pairs, quote_arg};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const SERVER_HASH_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
const CLIENT_HASH_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// How to complete the AUTHENTICATE handshake.
#[derive(Debug, Clone)]
pub enum Authenticator {
    /// Empty credential; the node must allow open control access.
    Null,
    /// UTF-8 password configured via HashedControlPassword.
    Password(String),
    /// Cookie file contents sent verbatim (hex-encoded on the wire).
    Cookie(PathBuf),
    /// Challenge-response over the cookie file; never reveals the cookie.
    SafeCookie(PathBuf),
}

impl Authenticator {
    /// Run the handshake on `client`. Exactly one AUTHENTICATE is sent; for
    /// SAFECOOKIE exactly one AUTHCHALLENGE precedes it.
    pub async fn authenticate(&self, client: &mut ControlClient) -> Result<()> {
        match self {
            Authenticator::Null => {
                debug!("authenticating with NULL credential");
                client.authenticate_raw("").await
            }
            Authenticator::Password(password) => {
                debug!("authenticating with password");
                client.authenticate_raw(&quote_arg(password)).await
            }
            Authenticator::Cookie(path) => {
                debug!(cookie = %path.display(), "authenticating with cookie");
                let cookie = read_cookie(path)?;
                client.authenticate_raw(&hex::encode_upper(cookie)).await
            }
            Authenticator::SafeCookie(path) => {
                debug!(cookie = %path.display(), "authenticating with SAFECOOKIE");
                let cookie = read_cookie(path)?;
                safe_cookie_handshake(client, &cookie).await
            }
        }
    }

    /// Pick the strongest handshake the node advertises. Password access
    /// cannot be negotiated (the secret is not ours to invent).
    pub fn negotiate(info: &ProtocolInfo) -> Result<Authenticator> {
        if info.methods.iter().any(|m| m == "NULL") {
            return Ok(Authenticator::Null);
        }
        if let Some(path) = &info.cookie_file {
            if info.methods.iter().any(|m| m == "SAFECOOKIE") {
                return Ok(Authenticator::SafeCookie(path.clone()));
            }
            if info.methods.iter().any(|m| m == "COOKIE") {
                return Ok(Authenticator::Cookie(path.clone()));
            }
        }
        Err(TorError::Auth(format!(
            "no negotiable authentication method in {:?}",
            info.methods
        )))
    }
}

async fn safe_cookie_handshake(client: &mut ControlClient, cookie: &[u8]) -> Result<()> {
    let client_nonce = random_nonce();
    let reply = client.auth_challenge(&hex::encode_upper(client_nonce)).await?;
    let (server_hash, server_nonce) = parse_challenge(reply.first_line())?;

    let expected = keyed_digest(SERVER_HASH_KEY, cookie, &client_nonce, &server_nonce);
    if !constant_time_eq(&expected, &server_hash) {
        return Err(TorError::Auth(
            "SAFECOOKIE server hash mismatch, node cannot read our cookie".into(),
        ));
    }

    let payload = keyed_digest(CLIENT_HASH_KEY, cookie, &client_nonce, &server_nonce);
    client.authenticate_raw(&hex::encode_upper(payload)).await
}

/// Read the auth cookie; it is always exactly 32 bytes.
pub fn read_cookie(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path)
        .map_err(|e| TorError::Auth(format!("cannot read cookie {}: {e}", path.display())))?;
    if data.len() != 32 {
        return Err(TorError::Auth(format!(
            "cookie {} has length {}, expected 32",
            path.display(),
            data.len()
        )));
    }
    Ok(data)
}

fn random_nonce() -> [u8; 32] {
    use rand::Rng;
    let mut nonce = [0u8; 32];
    rand::rng().fill(&mut nonce);
    nonce
}

/// `HMAC-SHA256(key, cookie ‖ client_nonce ‖ server_nonce)`.
pub(crate) fn keyed_digest(
    key: &[u8],
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("any key length is valid for HMAC");
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    mac.finalize().into_bytes().into()
}

/// The AUTHENTICATE payload for a completed SAFECOOKIE exchange.
pub fn safe_cookie_payload(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    keyed_digest(CLIENT_HASH_KEY, cookie, client_nonce, server_nonce)
}

/// The server hash a genuine node must present.
pub fn safe_cookie_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> [u8; 32] {
    keyed_digest(SERVER_HASH_KEY, cookie, client_nonce, server_nonce)
}

fn parse_challenge(line: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let pairs = parse_pairs(line);
    let decode = |key: &str| -> Result<Vec<u8>> {
        let value = pairs
            .get(key)
            .ok_or_else(|| TorError::Parse(format!("AUTHCHALLENGE reply missing {key}")))?;
        let bytes = hex::decode(value)
            .map_err(|e| TorError::Parse(format!("bad {key} hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(TorError::Parse(format!(
                "{key} has length {}, expected 32",
                bytes.len()
            )));
        }
        Ok(bytes)
    };
    Ok((decode("SERVERHASH")?, decode("SERVERNONCE")?))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Parsed PROTOCOLINFO reply.
#[derive(Debug, Clone)]
pub struct ProtocolInfo {
    /// Advertised authentication method names.
    pub methods: Vec<String>,
    /// Cookie file location, when cookie methods are offered.
    pub cookie_file: Option<PathBuf>,
    /// Node version string.
    pub version: String,
}

impl ProtocolInfo {
    /// Parse the lines of a PROTOCOLINFO reply.
    pub fn parse(lines: &[String]) -> Self {
        let mut methods = Vec::new();
        let mut cookie_file = None;
        let mut version = String::new();
        for line in lines {
            if let Some(rest) = line.strip_prefix("AUTH ") {
                let pairs = parse_pairs(rest);
                if let Some(list) = pairs.get("METHODS") {
                    methods = list.split(',').map(str::to_string).collect();
                }
                if let Some(file) = pairs.get("COOKIEFILE") {
                    cookie_file = Some(PathBuf::from(file));
                }
            } else if let Some(rest) = line.strip_prefix("VERSION ") {
                if let Some(v) = parse_pairs(rest).get("Tor") {
                    version = v.clone();
                }
            }
        }
        ProtocolInfo {
            methods,
            cookie_file,
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }

    #[test]
    fn server_and_client_digests_differ() {
        let cookie = [0xA1u8; 32];
        let n = [1u8; 32];
        let m = [2u8; 32];
        let server = safe_cookie_server_hash(&cookie, &n, &m);
        let client = safe_cookie_payload(&cookie, &n, &m);
        assert_ne!(server, client);
        assert!(constant_time_eq(
            &server,
            &safe_cookie_server_hash(&cookie, &n, &m)
        ));
        assert!(!constant_time_eq(&server, &client));
    }

    #[test]
    fn payload_depends_on_every_input() {
        let cookie = [0xA1u8; 32];
        let n = [1u8; 32];
        let m = [2u8; 32];
        let base = safe_cookie_payload(&cookie, &n, &m);
        assert_ne!(base, safe_cookie_payload(&[0xA2u8; 32], &n, &m));
        assert_ne!(base, safe_cookie_payload(&cookie, &[9u8; 32], &m));
        assert_ne!(base, safe_cookie_payload(&cookie, &n, &[9u8; 32]));
    }

    #[test]
    fn challenge_parsing() {
        let hash = "AA".repeat(32);
        let nonce = "BB".repeat(32);
        let (h, n) =
            parse_challenge(&format!("AUTHCHALLENGE SERVERHASH={hash} SERVERNONCE={nonce}"))
                .unwrap();
        assert_eq!(h, vec![0xAA; 32]);
        assert_eq!(n, vec![0xBB; 32]);

        assert!(parse_challenge("AUTHCHALLENGE SERVERHASH=AA").is_err());
        assert!(parse_challenge(&format!("AUTHCHALLENGE SERVERNONCE={nonce}")).is_err());
    }

    #[test]
    fn cookie_length_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        std::fs::write(&path, vec![7u8; 31]).unwrap();
        assert!(matches!(read_cookie(&path), Err(TorError::Auth(_))));

        std::fs::write(&path, vec![7u8; 32]).unwrap();
        assert_eq!(read_cookie(&path).unwrap(), vec![7u8; 32]);
    }

    #[test]
    fn protocol_info_parsing() {
        let lines = vec![
            "PROTOCOLINFO 1".to_string(),
            "AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/work/.tor/control_auth_cookie\""
                .to_string(),
            "VERSION Tor=\"0.4.8.12\"".to_string(),
            "OK".to_string(),
        ];
        let info = ProtocolInfo::parse(&lines);
        assert_eq!(info.methods, vec!["COOKIE", "SAFECOOKIE"]);
        assert_eq!(
            info.cookie_file.as_deref(),
            Some(Path::new("/work/.tor/control_auth_cookie"))
        );
        assert_eq!(info.version, "0.4.8.12");

        let picked = Authenticator::negotiate(&info).unwrap();
        assert!(matches!(picked, Authenticator::SafeCookie(_)));
    }

    #[test]
    fn negotiation_prefers_null_and_fails_on_password_only() {
        let null = ProtocolInfo {
            methods: vec!["NULL".into(), "SAFECOOKIE".into()],
            cookie_file: None,
            version: String::new(),
        };
        assert!(matches!(
            Authenticator::negotiate(&null).unwrap(),
            Authenticator::Null
        ));

        let pw_only = ProtocolInfo {
            methods: vec!["HASHEDPASSWORD".into()],
            cookie_file: None,
            version: String::new(),
        };
        assert!(Authenticator::negotiate(&pw_only).is_err());
    }
}
