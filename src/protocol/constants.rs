//! Protocol constants

/// Default streaming server port
pub const DEFAULT_STREAM_PORT: u16 = 5555;

/// Default trigger-only server port
pub const DEFAULT_TRIGGER_PORT: u16 = 5556;

/// Default read size for fixed-chunk (non size-prepended) streams
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Size of every length prefix on the wire
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest negotiation payload a server accepts
pub const MAX_REQUEST_SIZE: u32 = 64 * 1024;

/// Default upper bound on a single size-prepended frame
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Format requested when a negotiation payload omits one
pub const DEFAULT_FORMAT: &str = "h264";

/// Maximum UDP datagram payload used by outbound socket sinks
pub const UDP_DATAGRAM_SIZE: usize = 1024;
