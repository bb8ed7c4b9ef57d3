//! Frame sinks
//!
//! Anything that accepts delivered frames implements [`Sink`]. Sockets, files
//! and plain closures are adapted to it at the boundary:
//!
//! - [`InboundSocketSink`]: a connection accepted by the streaming server
//! - [`OutboundSocketSink`]: a connection this process opens to a remote host
//! - [`FileSink`]: an open file
//! - [`CallbackSink`]: a user closure

mod callback;
mod file;
mod inbound;
mod outbound;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use callback::CallbackSink;
pub use file::FileSink;
pub use inbound::InboundSocketSink;
pub use outbound::{Greeting, OutboundSocketSink, OutboundTarget, Transport};

/// Destination for delivered frames
///
/// `write` returning `Ok(false)` or `Err(_)` asks the owner to drop this sink;
/// delivery to other sinks is unaffected.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one frame
    async fn write(&self, frame: Bytes) -> Result<bool>;

    /// Release the underlying resource
    async fn close(&self) {}
}

/// Name of a sink within one distributor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(String);

impl SinkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SinkId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SinkId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<SocketAddr> for SinkId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}
