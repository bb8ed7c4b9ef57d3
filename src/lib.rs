//! camshare: share one capture device's encode channels across many consumers
//!
//! A capture device offers a handful of concurrent encode channels. This
//! crate hands them out per distinct stream configuration and fans each
//! channel's output to any number of sinks: sockets, files, closures.
//!
//! ```text
//! CaptureDevice --> EncoderOutput --> FrameAssembler --> Distributor --> Sink
//!      ^                                                     |        \-> Sink
//!      |                                                     v
//!  ChannelPool <---- StreamSession (one per StreamKey) <-- StreamServer <-- TCP clients
//! ```
//!
//! - [`pool`]: channel allocation keyed by stream configuration, plus stills
//! - [`session`]: one running encode and its consumers
//! - [`distributor`]: ordered, non-blocking fan-out to sinks
//! - [`server`]: the TCP stream server and trigger listener
//! - [`client`]: fetching or receiving remote streams
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use camshare::device::{Resolution, SyntheticDevice};
//! use camshare::pool::{ChannelPool, PoolConfig};
//! use camshare::server::{ServerConfig, StreamServer};
//!
//! # async fn example() -> camshare::error::Result<()> {
//! let device = Arc::new(SyntheticDevice::new(Resolution::new(1280, 720)));
//! let pool = ChannelPool::new(PoolConfig::default());
//! let server = StreamServer::bind(ServerConfig::default(), pool, device).await?;
//! server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod device;
pub mod distributor;
pub mod error;
pub mod media;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sink;
pub mod stats;

pub use client::{ClientConfig, StreamClient};
pub use device::{CaptureDevice, Channel, EncoderOutput, Resolution};
pub use distributor::{Distributor, DistributorConfig};
pub use error::{Error, Result};
pub use pool::{ChannelPool, PoolConfig, StreamKey, StreamOptions};
pub use protocol::StreamRequest;
pub use server::{ServerConfig, StreamServer, TriggerConfig, TriggerHandler, TriggerServer};
pub use session::{SessionConfig, StreamSession};
pub use sink::{Sink, SinkId};
