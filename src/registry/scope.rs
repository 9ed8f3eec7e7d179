//! Broadcast scope: the live pipe of one published stream name
//!
//! A scope lives while anything is connected to it. Every connect event
//! counts up, every disconnect counts down; when the count drops to zero the
//! scope unregisters itself from the provider service and refuses any later
//! subscription, so a stale scope can never be joined.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::media::StreamCodecInfo;
use crate::messaging::{
    Consumer, EndpointId, OobControlMessage, Pipe, PipeConnectionEvent, PipeConnectionListener,
    PipeMessage, Provider,
};

use super::key::StreamKey;
use super::store::ProviderService;

pub struct BroadcastScope {
    key: StreamKey,
    pipe: Arc<Pipe>,
    components: AtomicI64,
    removed: AtomicBool,
    /// Serializes the removed-check with the subscription itself
    subscribe_lock: Mutex<()>,
    codec_info: RwLock<Option<Arc<StreamCodecInfo>>>,
    service: Weak<ProviderService>,
    created_at: Instant,
}

struct ScopeListener(Weak<BroadcastScope>);

impl PipeConnectionListener for ScopeListener {
    fn on_pipe_connection_event(&self, _pipe: &Pipe, event: &PipeConnectionEvent) {
        if let Some(scope) = self.0.upgrade() {
            scope.on_connection_event(event);
        }
    }
}

impl BroadcastScope {
    pub(crate) fn new(key: StreamKey, service: Weak<ProviderService>) -> Arc<Self> {
        let scope = Arc::new(Self {
            key,
            pipe: Arc::new(Pipe::push_push()),
            components: AtomicI64::new(0),
            removed: AtomicBool::new(false),
            subscribe_lock: Mutex::new(()),
            codec_info: RwLock::new(None),
            service,
            created_at: Instant::now(),
        });
        scope
            .pipe
            .add_listener(Arc::new(ScopeListener(Arc::downgrade(&scope))));
        scope
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the scope emptied and was dropped from the registry
    pub fn has_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn subscribe_provider(&self, provider: Arc<dyn Provider>) -> bool {
        let _guard = self.subscribe_lock.lock();
        !self.has_removed() && self.pipe.subscribe_provider(provider)
    }

    pub fn subscribe_consumer(&self, consumer: Arc<dyn Consumer>) -> bool {
        let _guard = self.subscribe_lock.lock();
        !self.has_removed() && self.pipe.subscribe_consumer(consumer)
    }

    pub fn unsubscribe_provider(&self, id: EndpointId) -> bool {
        self.pipe.unsubscribe_provider(id)
    }

    pub fn unsubscribe_consumer(&self, id: EndpointId) -> bool {
        self.pipe.unsubscribe_consumer(id)
    }

    pub fn push_message(&self, message: &PipeMessage) -> Result<()> {
        self.pipe.push_message(message)
    }

    pub fn send_oob_to_consumers(&self, msg: &mut OobControlMessage) {
        self.pipe.send_oob_to_consumers(msg);
    }

    pub fn consumer_count(&self) -> usize {
        self.pipe.consumer_count()
    }

    pub fn provider_count(&self) -> usize {
        self.pipe.provider_count()
    }

    /// Codec state of the publisher feeding this scope
    pub fn codec_info(&self) -> Option<Arc<StreamCodecInfo>> {
        self.codec_info.read().clone()
    }

    pub fn set_codec_info(&self, info: Option<Arc<StreamCodecInfo>>) {
        *self.codec_info.write() = info;
    }

    fn on_connection_event(&self, event: &PipeConnectionEvent) {
        match event {
            PipeConnectionEvent::ProviderConnectPush(_)
            | PipeConnectionEvent::ProviderConnectPull(_)
            | PipeConnectionEvent::ConsumerConnectPush(_)
            | PipeConnectionEvent::ConsumerConnectPull(_) => {
                self.components.fetch_add(1, Ordering::AcqRel);
            }
            PipeConnectionEvent::ProviderDisconnect(_)
            | PipeConnectionEvent::ConsumerDisconnect(_) => {
                let remaining = self.components.fetch_sub(1, Ordering::AcqRel) - 1;
                if remaining <= 0 && !self.removed.swap(true, Ordering::AcqRel) {
                    tracing::info!(stream = %self.key, "Broadcast scope empty, removing");
                    if let Some(service) = self.service.upgrade() {
                        service.remove_scope(self);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BroadcastScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastScope")
            .field("key", &self.key)
            .field("components", &self.components.load(Ordering::Relaxed))
            .field("removed", &self.has_removed())
            .finish()
    }
}
