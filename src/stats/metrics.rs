//! Statistics for streams

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counter tracking the current, maximum and total number of something
#[derive(Debug, Default)]
pub struct StatisticsCounter {
    current: AtomicI64,
    max: AtomicI64,
    total: AtomicU64,
}

impl StatisticsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        let current = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(current, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> i64 {
        self.max.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Playback statistics of a subscriber stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStats {
    /// Media bytes sent to the client
    pub bytes_sent: u64,
    /// Timestamp of the last message sent
    pub current_timestamp: i64,
    /// Expected client buffer fill, in percent of the requested buffer
    pub estimated_buffer_fill: f64,
}

/// Statistics of a published stream
#[derive(Debug, Clone)]
pub struct BroadcastStats {
    /// Published name
    pub name: Option<String>,
    /// Creation time
    pub created_at: Instant,
    /// Media bytes received from the publisher
    pub bytes_received: u64,
    /// Video frames received
    pub video_frames: u64,
    /// Audio frames received
    pub audio_frames: u64,
    /// Keyframes received
    pub keyframes: u64,
    /// Timestamp of the last packet
    pub current_timestamp: i64,
    /// Subscribers currently connected
    pub active_subscribers: i64,
    /// Most subscribers connected at once
    pub max_subscribers: i64,
    /// Subscribers ever connected
    pub total_subscribers: u64,
    /// Selected video codec
    pub video_codec: Option<&'static str>,
}

impl BroadcastStats {
    pub fn new(created_at: Instant) -> Self {
        Self {
            name: None,
            created_at,
            bytes_received: 0,
            video_frames: 0,
            audio_frames: 0,
            keyframes: 0,
            current_timestamp: 0,
            active_subscribers: 0,
            max_subscribers: 0,
            total_subscribers: 0,
            video_codec: None,
        }
    }

    /// Time since the stream was created
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Received bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration().as_secs();
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }
}
