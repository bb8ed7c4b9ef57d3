//! Channel pool configuration

/// Number of concurrent encode channels on common capture hardware
pub const DEFAULT_CHANNELS: u8 = 4;

/// Channel pool options
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Encode channels numbered `0..channels`
    pub channels: u8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl PoolConfig {
    pub fn channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }
}
