//! Sink over a server-accepted connection

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

use super::Sink;
use crate::error::{Error, Result};

type CloseHook = Box<dyn FnOnce(SocketAddr) + Send>;

/// Write side of a connection accepted by the streaming server
///
/// The first failed write, or an explicit close, shuts the connection and
/// runs the close hook exactly once.
pub struct InboundSocketSink<W = OwnedWriteHalf> {
    peer: SocketAddr,
    writer: AsyncMutex<Option<W>>,
    write_timeout: Duration,
    end_of_stream: bool,
    on_close: Mutex<Option<CloseHook>>,
}

impl<W> InboundSocketSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(peer: SocketAddr, writer: W) -> Self {
        Self {
            peer,
            writer: AsyncMutex::new(Some(writer)),
            write_timeout: Duration::from_secs(5),
            end_of_stream: false,
            on_close: Mutex::new(None),
        }
    }

    /// Give up on a write that takes longer than `timeout`
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Send a zero-length frame before closing gracefully
    pub fn end_of_stream(mut self, enabled: bool) -> Self {
        self.end_of_stream = enabled;
        self
    }

    /// Run `hook` with the peer address once the connection is closed
    pub fn on_close<F>(self, hook: F) -> Self
    where
        F: FnOnce(SocketAddr) + Send + 'static,
    {
        *self.on_close.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection is still open for writing
    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    fn run_close_hook(&self) {
        let hook = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(self.peer);
        }
    }
}

#[async_trait]
impl<W> Sink for InboundSocketSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, frame: Bytes) -> Result<bool> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(false);
        };

        let result = match tokio::time::timeout(self.write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => return Ok(true),
            Ok(Err(e)) => Error::Connection(format!("write to {} failed: {}", self.peer, e)),
            Err(_) => Error::Connection(format!("write to {} timed out", self.peer)),
        };

        tracing::debug!(peer = %self.peer, error = %result, "Client socket disconnected");
        guard.take();
        drop(guard);
        self.run_close_hook();
        Err(result)
    }

    async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if self.end_of_stream {
                let _ = tokio::time::timeout(
                    self.write_timeout,
                    writer.write_all(&0u32.to_le_bytes()),
                )
                .await;
            }
            let _ = writer.shutdown().await;
            tracing::debug!(peer = %self.peer, "Client socket closed");
        }
        self.run_close_hook();
    }
}
