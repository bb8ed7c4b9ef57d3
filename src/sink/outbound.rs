//! Sink that pushes frames to a remote host

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

use super::Sink;
use crate::error::{Error, Result};
use crate::protocol::constants::UDP_DATAGRAM_SIZE;

/// Socket type used to reach the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

/// One item of the greeting sent right after a TCP connect
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Greeting {
    /// Sent as a u32 little-endian
    Int(u32),
    /// Sent as UTF-8
    Text(String),
    /// Sent verbatim
    #[serde(skip_deserializing)]
    Raw(Bytes),
}

/// Remote host definition, as found in a hosts file
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundTarget {
    pub port: u16,
    pub protocol: Transport,
    #[serde(default)]
    pub greeting: Vec<Greeting>,
}

enum Connection {
    Disconnected,
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Pushes every frame to `host:port`
///
/// A failed or stalled write marks the sink disconnected and asks to be
/// dropped; the owner may `connect()` again and re-attach it.
pub struct OutboundSocketSink {
    host: String,
    port: u16,
    transport: Transport,
    greeting: Vec<Greeting>,
    connect_timeout: Duration,
    write_timeout: Duration,
    conn: Mutex<Connection>,
}

impl OutboundSocketSink {
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            greeting: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            conn: Mutex::new(Connection::Disconnected),
        }
    }

    /// Build from a hosts-file entry
    pub fn from_target(host: impl Into<String>, target: OutboundTarget) -> Self {
        Self::new(host, target.port, target.protocol).greeting(target.greeting)
    }

    /// Items sent after each successful TCP connect
    pub fn greeting(mut self, greeting: Vec<Greeting>) -> Self {
        self.greeting = greeting;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Longest a single frame may take to hand to the socket
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn is_connected(&self) -> bool {
        !matches!(*self.conn.lock().await, Connection::Disconnected)
    }

    /// Connect if not already connected
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if !matches!(*conn, Connection::Disconnected) {
            return Ok(());
        }

        let addr = (self.host.as_str(), self.port);
        *conn = match self.transport {
            Transport::Tcp => {
                let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| {
                        Error::Connection(format!("connect to {}:{} timed out", self.host, self.port))
                    })??;
                if !self.greeting.is_empty() {
                    stream.write_all(&encode_greeting(&self.greeting)).await?;
                    stream.flush().await?;
                }
                Connection::Tcp(stream)
            }
            Transport::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
                socket.connect(addr).await?;
                Connection::Udp(socket)
            }
        };

        tracing::info!(host = %self.host, port = self.port, transport = ?self.transport, "Connected");
        Ok(())
    }
}

async fn send_datagrams(socket: &UdpSocket, frame: &[u8]) -> std::io::Result<()> {
    for datagram in frame.chunks(UDP_DATAGRAM_SIZE) {
        socket.send(datagram).await?;
    }
    Ok(())
}

fn encode_greeting(greeting: &[Greeting]) -> Bytes {
    let mut buf = BytesMut::new();
    for item in greeting {
        match item {
            Greeting::Int(value) => buf.put_u32_le(*value),
            Greeting::Text(text) => buf.put_slice(text.as_bytes()),
            Greeting::Raw(raw) => buf.put_slice(raw),
        }
    }
    buf.freeze()
}

#[async_trait]
impl Sink for OutboundSocketSink {
    async fn write(&self, frame: Bytes) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let result = match &mut *conn {
            Connection::Disconnected => return Ok(false),
            Connection::Tcp(stream) => {
                tokio::time::timeout(self.write_timeout, stream.write_all(&frame)).await
            }
            Connection::Udp(socket) => {
                tokio::time::timeout(self.write_timeout, send_datagrams(socket, &frame)).await
            }
        };

        let error = match result {
            Ok(Ok(())) => return Ok(true),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write stalled for {:?}", self.write_timeout),
        };
        tracing::warn!(host = %self.host, port = self.port, error = %error, "Socket disconnected");
        *conn = Connection::Disconnected;
        Ok(false)
    }

    async fn close(&self) {
        let mut conn = self.conn.lock().await;
        if let Connection::Tcp(stream) = &mut *conn {
            let _ = stream.shutdown().await;
        }
        *conn = Connection::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_greeting_encoding() {
        let greeting = vec![
            Greeting::Int(7),
            Greeting::Text("hi".into()),
            Greeting::Raw(Bytes::from_static(&[0xAA])),
        ];
        assert_eq!(&encode_greeting(&greeting)[..], &[7, 0, 0, 0, b'h', b'i', 0xAA]);
    }

    #[test]
    fn test_target_from_hosts_file_json() {
        let target: OutboundTarget =
            serde_json::from_str(r#"{"port": 9000, "protocol": "udp", "greeting": [1, "cam"]}"#)
                .unwrap();
        assert_eq!(target.protocol, Transport::Udp);
        assert_eq!(target.greeting, vec![Greeting::Int(1), Greeting::Text("cam".into())]);
    }

    #[tokio::test]
    async fn test_tcp_push_with_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sink = OutboundSocketSink::new("127.0.0.1", port, Transport::Tcp)
            .greeting(vec![Greeting::Int(2)]);

        assert!(!sink.write(Bytes::from_static(b"early")).await.unwrap());
        sink.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        assert!(sink.write(Bytes::from_static(b"frame")).await.unwrap());
        sink.close().await;

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"\x02\0\0\0frame");
        assert!(!sink.is_connected().await);
    }

    #[tokio::test]
    async fn test_stalled_peer_disconnects_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sink = OutboundSocketSink::new("127.0.0.1", port, Transport::Tcp)
            .write_timeout(Duration::from_millis(50));
        sink.connect().await.unwrap();
        // accepted but never read
        let (_peer, _) = listener.accept().await.unwrap();

        let frame = Bytes::from(vec![0u8; 8 * 1024 * 1024]);
        let mut dropped = false;
        for _ in 0..16 {
            let started = std::time::Instant::now();
            if !sink.write(frame.clone()).await.unwrap() {
                assert!(started.elapsed() < Duration::from_secs(2));
                dropped = true;
                break;
            }
        }
        assert!(dropped);
        assert!(!sink.is_connected().await);
        assert!(!sink.write(Bytes::from_static(b"late")).await.unwrap());
    }

    #[tokio::test]
    async fn test_udp_splits_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let sink = OutboundSocketSink::new("127.0.0.1", port, Transport::Udp);
        sink.connect().await.unwrap();

        let frame = Bytes::from(vec![1u8; UDP_DATAGRAM_SIZE + 10]);
        assert!(sink.write(frame).await.unwrap());

        let mut buf = [0u8; 2048];
        assert_eq!(receiver.recv(&mut buf).await.unwrap(), UDP_DATAGRAM_SIZE);
        assert_eq!(receiver.recv(&mut buf).await.unwrap(), 10);
    }
}
