//! Capture device collaborator
//!
//! The hardware driver is external to this crate. It is reached only through
//! [`CaptureDevice`], constructed once by the process and passed by `Arc` to
//! whatever needs it.
//!
//! Encoded output flows back through an [`EncoderOutput`] handle that the
//! driver calls from its own thread; writes never block the driver.

mod output;
mod resolution;
pub mod synthetic;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::pool::StreamOptions;

pub use output::EncoderOutput;
pub use resolution::Resolution;
pub use synthetic::SyntheticDevice;

/// Handle to one of the device's concurrent encode slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(pub u8);

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operations the capture hardware must support
///
/// Implementations are expected to be cheap to call from async code; any of
/// them that genuinely block (`wait_duration`, `capture_once`) are invoked on
/// a blocking thread by the session layer.
pub trait CaptureDevice: Send + Sync {
    /// Resolution the sensor is configured for
    fn native_resolution(&self) -> Resolution;

    /// Begin continuous encoding on `channel`, routing output into `output`
    ///
    /// `resize` is `None` when the native resolution should be used.
    fn start_encoding(
        &self,
        output: EncoderOutput,
        format: &str,
        resize: Option<Resolution>,
        channel: Channel,
        options: &StreamOptions,
    ) -> Result<()>;

    /// Halt encoding on `channel`
    fn stop_encoding(&self, channel: Channel) -> Result<()>;

    /// Switch the live output of `channel` without restarting the encoder
    fn split_output(&self, output: EncoderOutput, channel: Channel) -> Result<()>;

    /// Block while `channel` keeps encoding, surfacing encoder errors
    fn wait_duration(&self, duration: Duration, channel: Channel) -> Result<()>;

    /// Encode a single still image on `channel`
    fn capture_once(&self, format: &str, channel: Channel, options: &StreamOptions)
        -> Result<Bytes>;
}
