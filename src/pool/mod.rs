//! Encode channel pool
//!
//! The capture device only has a handful of encode channels. The pool hands
//! them out per [`StreamKey`], so every request with the same format,
//! resolution and options lands on one shared session:
//!
//! ```text
//!   request(h264, 720p) ─┐
//!   request(h264, 720p) ─┼──► StreamSession ch0
//!   request(mjpeg, 480p) ────► StreamSession ch1
//!                              free: [ch2, ch3]
//! ```

pub mod config;
pub mod key;
pub mod store;

pub use config::PoolConfig;
pub use key::{StreamKey, StreamOptions};
pub use store::{ChannelPool, StillCapture};
