//! The control-port connection.
//!
//! One [`ControlConnection`] exclusively owns one TCP socket. A background
//! reader task assembles complete replies and demultiplexes them by status
//! code: 650-coded events go to the event channel, everything else answers
//! the command in flight. Commands are strictly ordered because sending
//! takes `&mut self` and each send awaits its reply before returning.

use crate::error::{Result, TorError};
use crate::events::RawEvent;
use crate::protocol::{unescape_data_line, Reply, ReplyLine};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Receiving side of the demultiplexed event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<RawEvent>;

/// An exclusive connection to the control port.
pub struct ControlConnection {
    writer: BufWriter<OwnedWriteHalf>,
    replies: mpsc::UnboundedReceiver<Result<Reply>>,
    reader: JoinHandle<()>,
}

impl ControlConnection {
    /// Connect and start the background reader. Returns the connection and
    /// the event stream it feeds.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, EventReceiver)> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected socket.
    pub fn from_stream(stream: TcpStream) -> (Self, EventReceiver) {
        let (read_half, write_half) = stream.into_split();
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, reply_tx, event_tx));
        (
            ControlConnection {
                writer: BufWriter::new(write_half),
                replies,
                reader,
            },
            events,
        )
    }

    /// Send one CRLF-terminated command line and await its reply.
    pub async fn send(&mut self, command: &str) -> Result<Reply> {
        trace!(command = command.trim_end(), "control >");
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.flush().await?;
        match self.replies.recv().await {
            Some(reply) => reply,
            None => Err(TorError::ConnectionClosed),
        }
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Read replies forever, routing events and solicited replies to their
/// channels. Ends when the socket closes or either channel is gone.
async fn read_loop(
    read_half: OwnedReadHalf,
    reply_tx: mpsc::UnboundedSender<Result<Reply>>,
    event_tx: mpsc::UnboundedSender<RawEvent>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        match read_reply(&mut reader).await {
            Ok(reply) => {
                trace!(status = reply.status, line = reply.first_line(), "control <");
                if reply.is_event() {
                    if event_tx.send(RawEvent::from_reply(&reply)).is_err() && reply_tx.is_closed()
                    {
                        return;
                    }
                } else if reply_tx.send(Ok(reply)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = reply_tx.send(Err(err));
                return;
            }
        }
    }
}

/// Assemble one complete reply: mid lines until a final line, reading out
/// any dot-terminated data blocks along the way.
async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> Result<Reply> {
    let mut lines = Vec::new();
    let mut data = Vec::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            return Err(TorError::ConnectionClosed);
        }
        let line = ReplyLine::parse(buf.trim_end_matches(['\r', '\n']))?;
        if line.opens_data() {
            data.push(read_data_block(reader).await?);
        }
        let done = line.is_final();
        lines.push(line);
        if done {
            return Reply::from_lines(lines, data);
        }
    }
}

/// Read lines until the terminating `.`, undoing dot-stuffing.
async fn read_data_block(reader: &mut BufReader<OwnedReadHalf>) -> Result<String> {
    let mut block = String::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            return Err(TorError::ConnectionClosed);
        }
        let line = buf.trim_end_matches(['\r', '\n']);
        if line == "." {
            return Ok(block);
        }
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(unescape_data_line(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn replies_and_events_are_demultiplexed() {
        let (client, mut server) = pair().await;
        let (mut conn, mut events) = ControlConnection::from_stream(client);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GETINFO version\r\n");
            // An event arrives before the solicited reply; both must land
            // in the right place.
            server
                .write_all(b"650 CIRC 4 BUILT\r\n250-version=0.4.8.12\r\n250 OK\r\n")
                .await
                .unwrap();
            server
        });

        let reply = conn.send("GETINFO version\r\n").await.unwrap();
        assert_eq!(reply.status, 250);
        assert_eq!(reply.value_of("version"), Some("0.4.8.12"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, "CIRC");
        assert_eq!(event.payload, "4 BUILT");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn data_blocks_are_collected() {
        let (client, mut server) = pair().await;
        let (mut conn, _events) = ControlConnection::from_stream(client);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"250+config-text=\r\nSocksPort auto\r\n..dotted\r\n.\r\n250 OK\r\n")
                .await
                .unwrap();
            // Keep the socket open until the client is done reading.
            let _ = server.read(&mut buf).await;
        });

        let reply = conn.send("GETINFO config-text\r\n").await.unwrap();
        assert_eq!(reply.data.len(), 1);
        assert_eq!(reply.data[0], "SocksPort auto\n.dotted");
    }

    #[tokio::test]
    async fn closed_socket_surfaces_as_connection_lost() {
        let (client, server) = pair().await;
        let (mut conn, _events) = ControlConnection::from_stream(client);
        drop(server);

        match conn.send("GETINFO version\r\n").await {
            Err(TorError::ConnectionClosed) | Err(TorError::Io(_)) => {}
            other => panic!("expected connection loss, got {other:?}"),
        }
    }
}
