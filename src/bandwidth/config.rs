//! Bandwidth configuration

use std::time::Duration;

use super::{AUDIO, DATA, OVERALL, VIDEO};

/// Settings of the token distributor
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// How often tokens are added to every bucket
    pub interval: Duration,

    /// Buckets stop refilling once they hold this many tokens
    pub default_capacity: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            default_capacity: 104_857_600, // 100MB
        }
    }
}

impl BandwidthConfig {
    /// Set the refill interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the bucket capacity
    pub fn default_capacity(mut self, capacity: u64) -> Self {
        self.default_capacity = capacity;
        self
    }
}

/// Per-controllable rate limits
///
/// Rates are bits per second, indexed by [`AUDIO`], [`VIDEO`], [`DATA`] and
/// [`OVERALL`]. A negative rate leaves the channel unlimited. When the
/// overall rate is non-negative, all three channels draw from the overall
/// reserve instead of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthConfigure {
    pub channel_bandwidth: [i64; 4],

    /// Tokens available right after registration, negative for half the
    /// default capacity
    pub channel_initial_burst: [i64; 4],
}

impl Default for BandwidthConfigure {
    fn default() -> Self {
        Self {
            channel_bandwidth: [-1; 4],
            channel_initial_burst: [-1; 4],
        }
    }
}

impl BandwidthConfigure {
    /// Whether the overall channel is in charge
    pub fn is_overall(&self) -> bool {
        self.channel_bandwidth[OVERALL] >= 0
    }

    /// Set the overall rate
    pub fn overall(mut self, bits_per_sec: i64) -> Self {
        self.channel_bandwidth[OVERALL] = bits_per_sec;
        self
    }

    /// Set the audio rate
    pub fn audio(mut self, bits_per_sec: i64) -> Self {
        self.channel_bandwidth[AUDIO] = bits_per_sec;
        self
    }

    /// Set the video rate
    pub fn video(mut self, bits_per_sec: i64) -> Self {
        self.channel_bandwidth[VIDEO] = bits_per_sec;
        self
    }

    /// Set the data rate
    pub fn data(mut self, bits_per_sec: i64) -> Self {
        self.channel_bandwidth[DATA] = bits_per_sec;
        self
    }

    /// Set the initial token reserve of one channel
    pub fn initial_burst(mut self, channel: usize, tokens: i64) -> Self {
        if let Some(slot) = self.channel_initial_burst.get_mut(channel) {
            *slot = tokens;
        }
        self
    }
}
