//! Pass-through bandwidth service

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::{
    BandwidthContext, BandwidthControlService, BandwidthControllable, ControllableId,
    TokenBucket, TokenBucketCallback,
};

/// Service that never limits anything
#[derive(Debug, Default)]
pub struct DummyBandwidthControlService {
    registered: RwLock<HashSet<ControllableId>>,
}

impl DummyBandwidthControlService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
struct DummyBucket;

impl TokenBucket for DummyBucket {
    fn acquire_token(&self, _tokens: u64, _wait: Option<Duration>) -> bool {
        true
    }

    fn acquire_token_nonblocking(
        &self,
        _tokens: u64,
        _callback: Arc<dyn TokenBucketCallback>,
    ) -> bool {
        true
    }

    fn acquire_token_best_effort(&self, upper_limit: u64) -> u64 {
        upper_limit
    }

    fn capacity(&self) -> u64 {
        u64::MAX
    }

    fn speed(&self) -> f64 {
        -1.0
    }

    fn reset(&self) {}
}

impl BandwidthControlService for DummyBandwidthControlService {
    fn register(&self, controllable: &Arc<dyn BandwidthControllable>) -> BandwidthContext {
        let id = controllable.controllable_id();
        self.registered.write().insert(id);
        BandwidthContext::new(id)
    }

    fn unregister(&self, context: &BandwidthContext) {
        self.registered.write().remove(&context.controllable());
    }

    fn lookup_context(&self, controllable: ControllableId) -> Option<BandwidthContext> {
        self.registered
            .read()
            .contains(&controllable)
            .then(|| BandwidthContext::new(controllable))
    }

    fn update_bw_configure(&self, _context: &BandwidthContext) {}

    fn reset_buckets(&self, _context: &BandwidthContext) {}

    fn audio_bucket(&self, _context: &BandwidthContext) -> Arc<dyn TokenBucket> {
        Arc::new(DummyBucket)
    }

    fn video_bucket(&self, _context: &BandwidthContext) -> Arc<dyn TokenBucket> {
        Arc::new(DummyBucket)
    }

    fn data_bucket(&self, _context: &BandwidthContext) -> Arc<dyn TokenBucket> {
        Arc::new(DummyBucket)
    }
}
