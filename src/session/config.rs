//! Session configuration

use std::time::Duration;

use serde_json::Value;

use crate::device::Resolution;
use crate::distributor::config::DEFAULT_WORKERS;
use crate::pool::{StreamKey, StreamOptions};
use crate::protocol::constants::DEFAULT_FORMAT;

/// What one shared encode produces
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Encoder format
    pub format: String,

    /// Output size (`None` = device native)
    pub resolution: Option<Resolution>,

    /// Options passed to the encoder
    pub options: StreamOptions,

    /// Cut the encoder stream into frames before distribution
    pub split_frames: bool,

    /// Prefix each distributed frame with its length (split sessions only)
    pub prepend_size: bool,

    /// Stop once the last sink is removed
    pub stop_when_idle: bool,

    /// Concurrent sink deliveries
    pub workers: usize,

    /// How long `rebind` waits for the delivery loop
    pub rebind_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_FORMAT.to_string(),
            resolution: None,
            options: StreamOptions::new(),
            split_frames: true,
            prepend_size: false,
            stop_when_idle: true,
            workers: DEFAULT_WORKERS,
            rebind_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Config for `format` with all other settings at their defaults
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Self::default()
        }
    }

    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Parse a resize request, keeping native resolution when it is missing
    /// or unreadable
    pub fn resize(mut self, value: Option<&Value>, native: Resolution) -> Self {
        self.resolution = Some(Resolution::resolve(value, native));
        self
    }

    pub fn options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn split_frames(mut self, enabled: bool) -> Self {
        self.split_frames = enabled;
        self
    }

    pub fn prepend_size(mut self, enabled: bool) -> Self {
        self.prepend_size = enabled;
        self
    }

    pub fn stop_when_idle(mut self, enabled: bool) -> Self {
        self.stop_when_idle = enabled;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn rebind_timeout(mut self, timeout: Duration) -> Self {
        self.rebind_timeout = timeout;
        self
    }

    /// Resolution the encoder will run at
    pub fn effective_resolution(&self, native: Resolution) -> Resolution {
        self.resolution.unwrap_or(native)
    }

    /// Key identifying sessions that can serve this config
    pub fn key(&self, native: Resolution) -> StreamKey {
        StreamKey::new(
            &self.format,
            self.effective_resolution(native),
            self.split_frames,
            &self.options,
        )
    }
}
