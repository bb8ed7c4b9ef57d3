//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::Value;

use super::discovery::DiscoveryConfig;
use crate::pool::StreamOptions;
use crate::protocol::constants::{DEFAULT_FORMAT, DEFAULT_STREAM_PORT};

/// Streaming server options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum distinct stream keys served at once (0 = pool limit only)
    pub max_streams: usize,

    /// Send frames size-prepended, terminated by a zero length on close
    pub prepend_size: bool,

    /// Split encoder output into frames
    pub split_frames: bool,

    /// The negotiation payload must arrive within this time
    pub handshake_timeout: Duration,

    /// Drop a client whose socket accepts no data for this long
    pub write_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Encoder options applied under every request's own options
    pub recording_options: StreamOptions,

    /// Format used when a request names none
    pub default_format: String,

    /// Periodic self-announcement, if any
    pub discovery: Option<DiscoveryConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_STREAM_PORT)),
            max_streams: 2,
            prepend_size: true,
            split_frames: true,
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            recording_options: StreamOptions::new(),
            default_format: DEFAULT_FORMAT.to_string(),
            discovery: None,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the distinct stream limit
    pub fn max_streams(mut self, max: usize) -> Self {
        self.max_streams = max;
        self
    }

    pub fn prepend_size(mut self, enabled: bool) -> Self {
        self.prepend_size = enabled;
        self
    }

    pub fn split_frames(mut self, enabled: bool) -> Self {
        self.split_frames = enabled;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Add a default encoder option
    pub fn recording_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.recording_options.insert(name.into(), value.into());
        self
    }

    pub fn default_format(mut self, format: impl Into<String>) -> Self {
        self.default_format = format.into();
        self
    }

    /// Announce this server into a discovery registry
    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = Some(discovery);
        self
    }
}
