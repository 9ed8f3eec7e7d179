//! Stream statistics

pub mod metrics;

pub use metrics::{BroadcastStats, PlaybackStats, StatisticsCounter};
