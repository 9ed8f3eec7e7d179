//! Hierarchical bandwidth control
//!
//! Every streamable entity (stream, connection, ...) registers with a
//! [`BandwidthControlService`] and receives one token bucket per channel.
//! Acquiring tokens from a bucket charges the entity and every registered
//! ancestor; if any of them runs short the whole request is rolled back.
//!
//! ```text
//!   connection  [overall: 1 Mbit/s]
//!        │
//!        └── stream  [audio: 64 kbit/s] [video: 512 kbit/s] [data: -]
//! ```
//!
//! Two services exist: [`SimpleBandwidthControlService`] refills every bucket
//! from one periodic ticker, [`DummyBandwidthControlService`] grants
//! everything and is used when bandwidth control is disabled.

pub mod config;
pub mod dummy;
pub mod simple;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use config::{BandwidthConfig, BandwidthConfigure};
pub use dummy::DummyBandwidthControlService;
pub use simple::SimpleBandwidthControlService;

/// Audio channel index
pub const AUDIO: usize = 0;
/// Video channel index
pub const VIDEO: usize = 1;
/// Data channel index
pub const DATA: usize = 2;
/// Overall channel index
pub const OVERALL: usize = 3;

static NEXT_CONTROLLABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a bandwidth-controllable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllableId(u64);

impl ControllableId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        ControllableId(NEXT_CONTROLLABLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Entity whose outgoing bytes are rate limited
pub trait BandwidthControllable: Send + Sync {
    fn controllable_id(&self) -> ControllableId;

    /// Next entity up the containment tree
    fn parent_controllable(&self) -> Option<ControllableId>;

    /// Current limits, `None` for unlimited
    fn bandwidth_configure(&self) -> Option<BandwidthConfigure>;
}

/// Receiver of deferred token grants
pub trait TokenBucketCallback: Send + Sync {
    /// Tokens requested earlier have been acquired on the caller's behalf
    fn available(&self, bucket: &dyn TokenBucket, tokens: u64);

    /// The bucket was reset before the request could be satisfied
    fn reset(&self, bucket: &dyn TokenBucket, tokens: u64);
}

/// Token bucket of one channel of one controllable
pub trait TokenBucket: Send + Sync {
    /// Block until `tokens` are acquired along the whole ancestor chain
    ///
    /// `wait` of `None` waits forever. Returns `false` after rolling back
    /// partial grants when the wait runs out or the bucket is reset.
    fn acquire_token(&self, tokens: u64, wait: Option<Duration>) -> bool;

    /// Acquire without blocking
    ///
    /// On `false` the request stays queued and `callback` is told later
    /// whether it succeeded or was reset.
    fn acquire_token_nonblocking(&self, tokens: u64, callback: Arc<dyn TokenBucketCallback>)
        -> bool;

    /// Take what is available up to `upper_limit` and return the amount
    fn acquire_token_best_effort(&self, upper_limit: u64) -> u64;

    fn capacity(&self) -> u64;

    /// Refill speed in bytes per second, negative when unlimited
    fn speed(&self) -> f64;

    /// Fail every queued request that originated from this bucket
    fn reset(&self);
}

/// Registration handle returned by a bandwidth service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BandwidthContext {
    controllable: ControllableId,
}

impl BandwidthContext {
    pub(crate) fn new(controllable: ControllableId) -> Self {
        Self { controllable }
    }

    pub fn controllable(&self) -> ControllableId {
        self.controllable
    }
}

/// Bandwidth control service
pub trait BandwidthControlService: Send + Sync {
    fn register(&self, controllable: &Arc<dyn BandwidthControllable>) -> BandwidthContext;

    /// Reset the buckets and forget the controllable
    fn unregister(&self, context: &BandwidthContext);

    fn lookup_context(&self, controllable: ControllableId) -> Option<BandwidthContext>;

    /// Re-read the controllable's configuration, migrating reserves between
    /// overall and per-channel accounting when the mode changes
    fn update_bw_configure(&self, context: &BandwidthContext);

    /// Reset the audio, video and data buckets
    fn reset_buckets(&self, context: &BandwidthContext);

    fn audio_bucket(&self, context: &BandwidthContext) -> Arc<dyn TokenBucket>;

    fn video_bucket(&self, context: &BandwidthContext) -> Arc<dyn TokenBucket>;

    fn data_bucket(&self, context: &BandwidthContext) -> Arc<dyn TokenBucket>;
}
