//! Error types
//!
//! Expected rejections (no free channel, too many streams) and unexpected
//! failures (I/O, malformed peers) are distinct variants so callers can answer
//! the former at the protocol level and log-and-drop the latter.

use std::fmt;
use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate error type
#[derive(Debug)]
pub enum Error {
    /// No free channel, distinct-stream limit reached, or still channel busy
    ResourceExhausted(String),
    /// Peer unreachable or a read/write on an established connection failed
    Connection(String),
    /// Peer sent something that does not follow the wire protocol
    Protocol(ProtocolError),
    /// Invalid format/resolution/options, or the device rejected them
    Configuration(String),
    /// Device call failed after the stream was configured
    Device(String),
    /// No client stream is registered under this id
    UnknownStream(String),
    /// A client stream with this id is still running
    StreamActive(String),
    /// The session already reached its terminal state
    SessionStopped,
    /// A bounded wait expired
    Timeout(&'static str),
    /// Underlying I/O error
    Io(io::Error),
}

/// Wire protocol violations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Length prefix is zero or above the accepted maximum
    InvalidLength(u32),
    /// Negotiation payload is not valid UTF-8 JSON of the expected shape
    InvalidPayload(String),
    /// Frame length prefix exceeds the configured maximum
    FrameTooLarge(u32),
}

impl Error {
    /// Whether this is an expected "cannot serve" outcome rather than a fault
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted(what) => write!(f, "Resource exhausted: {}", what),
            Error::Connection(msg) => write!(f, "Connection failure: {}", msg),
            Error::Protocol(err) => write!(f, "Protocol violation: {}", err),
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::Device(msg) => write!(f, "Device error: {}", msg),
            Error::UnknownStream(id) => write!(f, "Unknown stream: {}", id),
            Error::StreamActive(id) => write!(f, "Stream still active: {}", id),
            Error::SessionStopped => write!(f, "Session already stopped"),
            Error::Timeout(what) => write!(f, "Timed out waiting for {}", what),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidLength(len) => write!(f, "invalid length prefix {}", len),
            ProtocolError::InvalidPayload(msg) => write!(f, "invalid negotiation payload: {}", msg),
            ProtocolError::FrameTooLarge(len) => write!(f, "frame of {} bytes exceeds limit", len),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(ProtocolError::InvalidPayload(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_is_distinct_from_faults() {
        assert!(Error::ResourceExhausted("channels".into()).is_exhausted());
        assert!(!Error::Connection("reset".into()).is_exhausted());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::Other, "x")).is_exhausted());
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidPayload(_))));
    }

    #[test]
    fn test_display() {
        let err = Error::Protocol(ProtocolError::InvalidLength(0));
        assert_eq!(err.to_string(), "Protocol violation: invalid length prefix 0");
    }
}
