//! Fan-out distribution
//!
//! One distributor sits between a session's encoder output and its sinks:
//!
//! ```text
//!   EncoderOutput::write ──► mpsc queue ──► delivery loop
//!                                               │  per frame, one task per sink
//!                              ┌────────────────┼────────────────┐
//!                              ▼                ▼                ▼
//!                          [socket]          [file]          [callback]
//! ```
//!
//! The producer side never waits on a sink. A rebind marker travels through
//! the same queue as frames, so sink set changes are ordered with respect to
//! delivery.

pub mod config;
pub mod fanout;

pub use config::DistributorConfig;
pub use fanout::{Distributor, RemoveHook};
