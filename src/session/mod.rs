//! Encode sessions
//!
//! A [`StreamSession`] owns one device channel, a [`Distributor`] and, when
//! frames are split, a [`FrameAssembler`] in front of it.
//!
//! [`Distributor`]: crate::distributor::Distributor
//! [`FrameAssembler`]: crate::media::FrameAssembler

pub mod config;
pub mod state;
pub mod stream;

pub use config::SessionConfig;
pub use state::SessionPhase;
pub use stream::StreamSession;
