//! Stream client
//!
//! Provides the consuming side of the wire protocol for:
//! - Fetching a negotiated stream from a remote stream server
//! - Receiving a stream that a remote host pushes to a local port
//! - Forwarding received frames into local sinks
//! - Remote-triggering a trigger listener

pub mod config;
pub mod stream;

pub use config::ClientConfig;
pub use stream::StreamClient;
