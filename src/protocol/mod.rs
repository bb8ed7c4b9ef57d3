//! Wire protocol
//!
//! A remote consumer opens a TCP connection and negotiates a stream:
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |---- u32 LE length N ------------------>|
//!   |---- N bytes UTF-8 JSON request ------->|
//!   |                                        |
//!   |<--- u32 LE 0 (rejected, then close) ---|   can't serve
//!   |                                        |
//!   |<--- u32 LE len + frame bytes ----------|   size-prepended
//!   |<--- ...                                |
//!   |<--- u32 LE 0 (end of stream) ----------|
//! ```
//!
//! Streams negotiated without size prefixes carry raw encoder chunks and are
//! read in fixed-size pieces with no terminator.

pub mod constants;
pub mod framing;
pub mod negotiation;

pub use framing::{read_frame, read_length, size_prefixed, write_length};
pub use negotiation::{read_request, write_rejection, write_request, StreamRequest};
