//! Outbound connections through the node's SOCKS proxy.
//!
//! [`ProxyHandle`] points at the session's SOCKS listener and optionally
//! carries a stream-isolation credential. The node buckets connections by
//! credential, so two handles with different stream ids never share a
//! circuit. [`TorStream`] is the connect-only socket built on top: fixed to
//! one destination, retrying the unknown-host window a few times before
//! giving up (onion descriptors often need a moment on first contact).

use crate::error::{Result, TorError};
use sha2::{Digest, Sha256};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_ISOLATION: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;

const CONNECT_TRIES: u32 = 5;
const CONNECT_RETRY_SLEEP: Duration = Duration::from_millis(500);

/// A handle on the node's local SOCKS listener, optionally tagged for
/// stream isolation.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    addr: SocketAddr,
    credential: Option<Vec<u8>>,
}

impl ProxyHandle {
    /// Handle for the listener on `port`, isolated under `stream_id` when
    /// one is given.
    pub fn new(port: u16, stream_id: Option<&str>) -> Self {
        ProxyHandle {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            credential: stream_id.map(|id| isolation_credential(id)),
        }
    }

    /// The SOCKS listener address.
    pub fn socks_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The isolation credential bytes, when tagged.
    pub fn credential(&self) -> Option<&[u8]> {
        self.credential.as_deref()
    }
}

/// Derive the isolation credential for a stream id: the SHA-256 digest of
/// the id, read as a signed big-endian integer and written in base 26. The
/// re-encoding keeps the credential inside the protocol's length limit.
pub fn isolation_credential(stream_id: &str) -> Vec<u8> {
    let digest: [u8; 32] = Sha256::digest(stream_id.as_bytes()).into();
    signed_base26(&digest).into_bytes()
}

/// Render a big-endian two's-complement integer in base 26, lowercase
/// digits, leading `-` for negative values.
fn signed_base26(bytes: &[u8]) -> String {
    let negative = bytes.first().is_some_and(|b| b & 0x80 != 0);
    let mut magnitude = bytes.to_vec();
    if negative {
        for b in magnitude.iter_mut() {
            *b = !*b;
        }
        for b in magnitude.iter_mut().rev() {
            let (sum, carry) = b.overflowing_add(1);
            *b = sum;
            if !carry {
                break;
            }
        }
    }

    let mut digits = Vec::new();
    while magnitude.iter().any(|&b| b != 0) {
        let mut remainder: u32 = 0;
        for b in magnitude.iter_mut() {
            let acc = (remainder << 8) | u32::from(*b);
            *b = (acc / 26) as u8;
            remainder = acc % 26;
        }
        digits.push(char::from_digit(remainder, 26).unwrap_or('0'));
    }
    if digits.is_empty() {
        digits.push('0');
    }

    let mut out = String::with_capacity(digits.len() + 1);
    if negative {
        out.push('-');
    }
    out.extend(digits.iter().rev());
    out
}

/// A connection to one destination, routed through the proxy. Immutable
/// after construction; reads and writes go straight to the underlying
/// socket.
pub struct TorStream {
    inner: TcpStream,
    destination: String,
    port: u16,
}

impl TorStream {
    /// Connect to `host:port` through `proxy`. Host-unreachable replies are
    /// retried with a short pause; everything else fails immediately.
    pub async fn connect(proxy: &ProxyHandle, host: &str, port: u16) -> Result<TorStream> {
        let mut tries = 0;
        loop {
            tries += 1;
            match connect_once(proxy, host, port).await {
                Ok(stream) => {
                    return Ok(TorStream {
                        inner: stream,
                        destination: host.to_string(),
                        port,
                    })
                }
                Err(ConnectError::HostUnreachable) if tries < CONNECT_TRIES => {
                    debug!(host, port, tries, "destination not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY_SLEEP).await;
                }
                Err(ConnectError::HostUnreachable) => {
                    return Err(TorError::Io(io::Error::new(
                        io::ErrorKind::HostUnreachable,
                        format!("{host}:{port} unreachable after {tries} tries"),
                    )))
                }
                Err(ConnectError::Auth(msg)) => return Err(TorError::Auth(msg)),
                Err(ConnectError::Other(e)) => return Err(TorError::Io(e)),
            }
        }
    }

    /// The destination this stream was built for.
    pub fn destination(&self) -> (&str, u16) {
        (&self.destination, self.port)
    }

    /// Unwrap the underlying socket.
    pub fn into_inner(self) -> TcpStream {
        self.inner
    }
}

enum ConnectError {
    HostUnreachable,
    Auth(String),
    Other(io::Error),
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        ConnectError::Other(e)
    }
}

async fn connect_once(
    proxy: &ProxyHandle,
    host: &str,
    port: u16,
) -> std::result::Result<TcpStream, ConnectError> {
    let mut stream = TcpStream::connect(proxy.socks_addr()).await?;
    stream.set_nodelay(true)?;

    let offered = if proxy.credential().is_some() {
        METHOD_ISOLATION
    } else {
        METHOD_NONE
    };
    stream.write_all(&[SOCKS_VERSION, 1, offered]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION || choice[1] == METHOD_UNACCEPTABLE {
        return Err(ConnectError::Auth(format!(
            "proxy refused method {offered:#04x}"
        )));
    }

    if choice[1] == METHOD_ISOLATION {
        let credential = proxy
            .credential()
            .ok_or_else(|| ConnectError::Auth("proxy demanded a credential we do not have".into()))?;
        negotiate_isolation(&mut stream, credential).await?;
    }

    send_connect(&mut stream, host, port).await?;
    Ok(stream)
}

/// Method-2 sub-negotiation: a tag byte, the length-prefixed credential, a
/// terminator pair; the 2-byte reply's second byte must be zero.
async fn negotiate_isolation(
    stream: &mut TcpStream,
    credential: &[u8],
) -> std::result::Result<(), ConnectError> {
    let mut frame = Vec::with_capacity(credential.len() + 4);
    frame.push(0x01);
    frame.push(credential.len() as u8);
    frame.extend_from_slice(credential);
    frame.extend_from_slice(&[0x01, 0x00]);
    stream.write_all(&frame).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0 {
        return Err(ConnectError::Auth(format!(
            "isolation credential rejected with status {}",
            status[1]
        )));
    }
    Ok(())
}

async fn send_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> std::result::Result<(), ConnectError> {
    if host.len() > u8::MAX as usize {
        return Err(ConnectError::Other(io::Error::new(
            io::ErrorKind::InvalidInput,
            "destination name too long",
        )));
    }
    let mut request = Vec::with_capacity(host.len() + 7);
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    match head[1] {
        REPLY_SUCCESS => {}
        REPLY_HOST_UNREACHABLE => return Err(ConnectError::HostUnreachable),
        other => {
            return Err(ConnectError::Other(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused connection: reply {other:#04x}"),
            )))
        }
    }

    // Drain the bind address so application data starts clean.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(ConnectError::Other(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address type {other:#04x} in proxy reply"),
            )))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}

impl AsyncRead for TorStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TorStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base26_small_values() {
        assert_eq!(signed_base26(&[0u8; 32]), "0");
        assert_eq!(signed_base26(&[0x01]), "1");
        assert_eq!(signed_base26(&[25]), "p");
        assert_eq!(signed_base26(&[26]), "10");
        assert_eq!(signed_base26(&[0x01, 0x00]), "9m"); // 256 = 9*26 + 22
    }

    #[test]
    fn base26_negative_values() {
        // All-ones two's complement is -1 regardless of width.
        assert_eq!(signed_base26(&[0xFF]), "-1");
        assert_eq!(signed_base26(&[0xFF; 32]), "-1");
        // 0x80 as a signed byte is -128 = -(4*26 + 24).
        assert_eq!(signed_base26(&[0x80]), "-4o");
    }

    #[test]
    fn distinct_stream_ids_give_distinct_credentials() {
        let a = isolation_credential("stream-a");
        let b = isolation_credential("stream-b");
        assert_ne!(a, b);
        // Credentials fit the single length byte of the handshake.
        assert!(a.len() <= u8::MAX as usize);
        assert!(b.len() <= u8::MAX as usize);
    }

    #[test]
    fn credential_is_stable() {
        assert_eq!(
            isolation_credential("stream-a"),
            isolation_credential("stream-a")
        );
    }

    #[test]
    fn handle_tagging() {
        let plain = ProxyHandle::new(9050, None);
        assert!(plain.credential().is_none());
        assert_eq!(plain.socks_addr().port(), 9050);

        let tagged = ProxyHandle::new(9050, Some("browser"));
        assert_eq!(
            tagged.credential().unwrap(),
            isolation_credential("browser").as_slice()
        );
    }
}
