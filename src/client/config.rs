//! Client configuration

use std::time::Duration;

use crate::protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_STREAM_PORT, DEFAULT_TRIGGER_PORT,
};

/// Stream client options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host running the stream server
    pub host: String,

    /// Port of the stream server
    pub stream_port: u16,

    /// Port of the trigger listener
    pub trigger_port: u16,

    /// Give up connecting after this long
    pub connect_timeout: Duration,

    /// Bytes per frame when frames are not size-prepended
    pub chunk_size: usize,

    /// Whether the server sends size-prepended frames
    pub size_prepended: bool,

    /// Largest size-prepended frame accepted
    pub max_frame_size: u32,
}

impl ClientConfig {
    /// Create a new client config for `host` with default settings
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            stream_port: DEFAULT_STREAM_PORT,
            trigger_port: DEFAULT_TRIGGER_PORT,
            connect_timeout: Duration::from_secs(5),
            chunk_size: DEFAULT_CHUNK_SIZE,
            size_prepended: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn stream_port(mut self, port: u16) -> Self {
        self.stream_port = port;
        self
    }

    pub fn trigger_port(mut self, port: u16) -> Self {
        self.trigger_port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read fixed-size chunks of `size` bytes instead of size-prepended frames
    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self.size_prepended = false;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }
}
