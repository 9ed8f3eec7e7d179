//! In-memory pipes connecting providers to consumers
//!
//! A push-push pipe fans every pushed message out to its consumers
//! synchronously. A pull-pull pipe hands the next message of the first
//! provider that has one to whichever consumer asks.
//!
//! Subscriber sets are guarded by a lock, but messages and connection events
//! are always dispatched from a snapshot with the lock released. Endpoints
//! may therefore subscribe, unsubscribe or push from inside a callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::Result;

use super::message::{PipeMessage, RtmpEvent};
use super::oob::OobControlMessage;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a pipe endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Delivery mode of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    PushPush,
    PullPull,
}

/// Connection change on a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeConnectionEvent {
    ProviderConnectPush(EndpointId),
    ProviderConnectPull(EndpointId),
    ConsumerConnectPush(EndpointId),
    ConsumerConnectPull(EndpointId),
    ProviderDisconnect(EndpointId),
    ConsumerDisconnect(EndpointId),
}

impl PipeConnectionEvent {
    /// Endpoint the event is about
    pub fn endpoint(&self) -> EndpointId {
        match *self {
            PipeConnectionEvent::ProviderConnectPush(id)
            | PipeConnectionEvent::ProviderConnectPull(id)
            | PipeConnectionEvent::ConsumerConnectPush(id)
            | PipeConnectionEvent::ConsumerConnectPull(id)
            | PipeConnectionEvent::ProviderDisconnect(id)
            | PipeConnectionEvent::ConsumerDisconnect(id) => id,
        }
    }
}

/// Behaviour shared by every pipe endpoint
pub trait MessageComponent: Send + Sync {
    fn endpoint_id(&self) -> EndpointId;

    /// Handle an out-of-band message sent from the other side of `pipe`
    fn on_oob_control_message(&self, _pipe: &Pipe, _msg: &mut OobControlMessage) {}

    /// Observe connection changes on a pipe this endpoint is subscribed to
    fn on_pipe_connection_event(&self, _pipe: &Pipe, _event: &PipeConnectionEvent) {}
}

/// Source side of a pipe
pub trait Provider: MessageComponent {
    /// Next message for a pull-mode consumer, `None` at end of stream
    fn pull_message(&self, _pipe: &Pipe) -> Result<Option<RtmpEvent>> {
        Ok(None)
    }

    /// Like [`Provider::pull_message`], waiting at most `wait` for data
    fn pull_message_timeout(&self, pipe: &Pipe, _wait: Duration) -> Result<Option<RtmpEvent>> {
        self.pull_message(pipe)
    }
}

/// Sink side of a pipe
pub trait Consumer: MessageComponent {
    fn push_message(&self, pipe: &Pipe, message: &PipeMessage) -> Result<()>;
}

/// Observer that is not itself an endpoint
pub trait PipeConnectionListener: Send + Sync {
    fn on_pipe_connection_event(&self, pipe: &Pipe, event: &PipeConnectionEvent);
}

#[derive(Clone)]
enum Listener {
    Provider(Arc<dyn Provider>),
    Consumer(Arc<dyn Consumer>),
    External(Arc<dyn PipeConnectionListener>),
}

impl Listener {
    fn notify(&self, pipe: &Pipe, event: &PipeConnectionEvent) {
        match self {
            Listener::Provider(p) => MessageComponent::on_pipe_connection_event(&**p, pipe, event),
            Listener::Consumer(c) => MessageComponent::on_pipe_connection_event(&**c, pipe, event),
            Listener::External(l) => l.on_pipe_connection_event(pipe, event),
        }
    }

    fn is_endpoint(&self, id: EndpointId) -> bool {
        match self {
            Listener::Provider(p) => p.endpoint_id() == id,
            Listener::Consumer(c) => c.endpoint_id() == id,
            Listener::External(_) => false,
        }
    }
}

/// In-memory pipe
pub struct Pipe {
    kind: PipeKind,
    providers: RwLock<Vec<Arc<dyn Provider>>>,
    consumers: RwLock<Vec<Arc<dyn Consumer>>>,
    listeners: RwLock<Vec<Listener>>,
}

impl Pipe {
    pub fn new(kind: PipeKind) -> Self {
        Self {
            kind,
            providers: RwLock::new(Vec::new()),
            consumers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Pipe that fans pushed messages out to consumers
    pub fn push_push() -> Self {
        Self::new(PipeKind::PushPush)
    }

    /// Pipe whose consumers pull from providers
    pub fn pull_pull() -> Self {
        Self::new(PipeKind::PullPull)
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    /// Register a provider; `false` if it is already subscribed
    pub fn subscribe_provider(&self, provider: Arc<dyn Provider>) -> bool {
        let id = provider.endpoint_id();
        {
            let mut providers = self.providers.write();
            if providers.iter().any(|p| p.endpoint_id() == id) {
                return false;
            }
            providers.push(Arc::clone(&provider));
        }
        self.listeners.write().push(Listener::Provider(provider));

        let event = match self.kind {
            PipeKind::PushPush => PipeConnectionEvent::ProviderConnectPush(id),
            PipeKind::PullPull => PipeConnectionEvent::ProviderConnectPull(id),
        };
        self.fire(&event);
        true
    }

    /// Register a consumer; `false` if it is already subscribed
    pub fn subscribe_consumer(&self, consumer: Arc<dyn Consumer>) -> bool {
        let id = consumer.endpoint_id();
        {
            let mut consumers = self.consumers.write();
            if consumers.iter().any(|c| c.endpoint_id() == id) {
                return false;
            }
            consumers.push(Arc::clone(&consumer));
        }
        self.listeners.write().push(Listener::Consumer(consumer));

        let event = match self.kind {
            PipeKind::PushPush => PipeConnectionEvent::ConsumerConnectPush(id),
            PipeKind::PullPull => PipeConnectionEvent::ConsumerConnectPull(id),
        };
        self.fire(&event);
        true
    }

    /// Remove a provider; it still observes its own disconnect event
    pub fn unsubscribe_provider(&self, id: EndpointId) -> bool {
        {
            let mut providers = self.providers.write();
            let before = providers.len();
            providers.retain(|p| p.endpoint_id() != id);
            if providers.len() == before {
                return false;
            }
        }
        self.fire(&PipeConnectionEvent::ProviderDisconnect(id));
        self.listeners.write().retain(|l| !l.is_endpoint(id));
        true
    }

    /// Remove a consumer; it still observes its own disconnect event
    pub fn unsubscribe_consumer(&self, id: EndpointId) -> bool {
        {
            let mut consumers = self.consumers.write();
            let before = consumers.len();
            consumers.retain(|c| c.endpoint_id() != id);
            if consumers.len() == before {
                return false;
            }
        }
        self.fire(&PipeConnectionEvent::ConsumerDisconnect(id));
        self.listeners.write().retain(|l| !l.is_endpoint(id));
        true
    }

    pub fn add_listener(&self, listener: Arc<dyn PipeConnectionListener>) {
        self.listeners.write().push(Listener::External(listener));
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PipeConnectionListener>) {
        self.listeners.write().retain(|l| match l {
            Listener::External(existing) => !Arc::ptr_eq(existing, listener),
            _ => true,
        });
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Whether an endpoint with this id is subscribed on either side
    pub fn is_subscribed(&self, id: EndpointId) -> bool {
        self.providers.read().iter().any(|p| p.endpoint_id() == id)
            || self.consumers.read().iter().any(|c| c.endpoint_id() == id)
    }

    /// Push a message to every consumer
    ///
    /// I/O failures abort the fan-out and are returned; any other consumer
    /// failure is logged and delivery continues. Pull pipes ignore pushes.
    pub fn push_message(&self, message: &PipeMessage) -> Result<()> {
        if self.kind == PipeKind::PullPull {
            return Ok(());
        }
        let consumers = self.consumers.read().clone();
        for consumer in consumers {
            if let Err(e) = consumer.push_message(self, message) {
                if e.is_io() {
                    return Err(e);
                }
                tracing::error!(
                    consumer = %consumer.endpoint_id(),
                    error = %e,
                    "Failed to push message to consumer"
                );
            }
        }
        Ok(())
    }

    /// Pull the next message from the first provider that has one
    pub fn pull_message(&self) -> Result<Option<RtmpEvent>> {
        if self.kind == PipeKind::PushPush {
            return Ok(None);
        }
        let providers = self.providers.read().clone();
        for provider in providers {
            match provider.pull_message(self) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(e) if e.is_io() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        provider = %provider.endpoint_id(),
                        error = %e,
                        "Failed to pull message from provider"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Pull with a deadline split evenly across the providers
    pub fn pull_message_timeout(&self, wait: Duration) -> Result<Option<RtmpEvent>> {
        if self.kind == PipeKind::PushPush {
            return Ok(None);
        }
        let providers = self.providers.read().clone();
        if providers.is_empty() {
            return Ok(None);
        }
        let share = wait / providers.len() as u32;
        for provider in providers {
            match provider.pull_message_timeout(self, share) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        provider = %provider.endpoint_id(),
                        error = %e,
                        "Failed to pull message from provider"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Deliver an OOB message from a consumer to every provider
    pub fn send_oob_to_providers(&self, msg: &mut OobControlMessage) {
        let providers = self.providers.read().clone();
        for provider in providers {
            provider.on_oob_control_message(self, msg);
        }
    }

    /// Deliver an OOB message from a provider to every consumer
    pub fn send_oob_to_consumers(&self, msg: &mut OobControlMessage) {
        let consumers = self.consumers.read().clone();
        for consumer in consumers {
            consumer.on_oob_control_message(self, msg);
        }
    }

    fn fire(&self, event: &PipeConnectionEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.notify(self, event);
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("kind", &self.kind)
            .field("providers", &self.provider_count())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;
    use crate::messaging::oob::{OobResult, OobService, OobTarget};

    struct Sink {
        id: EndpointId,
        received: Mutex<Vec<PipeMessage>>,
        events: Mutex<Vec<PipeConnectionEvent>>,
        fail_with_io: bool,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: EndpointId::next(),
                received: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                fail_with_io: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                id: EndpointId::next(),
                received: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                fail_with_io: true,
            })
        }
    }

    impl MessageComponent for Sink {
        fn endpoint_id(&self) -> EndpointId {
            self.id
        }

        fn on_pipe_connection_event(&self, _pipe: &Pipe, event: &PipeConnectionEvent) {
            self.events.lock().push(*event);
        }
    }

    impl Consumer for Sink {
        fn push_message(&self, _pipe: &Pipe, message: &PipeMessage) -> Result<()> {
            if self.fail_with_io {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "closed",
                )));
            }
            self.received.lock().push(message.clone());
            Ok(())
        }
    }

    struct Source {
        id: EndpointId,
        queue: Mutex<VecDeque<RtmpEvent>>,
    }

    impl Source {
        fn with(events: Vec<RtmpEvent>) -> Arc<Self> {
            Arc::new(Self {
                id: EndpointId::next(),
                queue: Mutex::new(events.into()),
            })
        }
    }

    impl MessageComponent for Source {
        fn endpoint_id(&self) -> EndpointId {
            self.id
        }

        fn on_oob_control_message(&self, _pipe: &Pipe, msg: &mut OobControlMessage) {
            if msg.target == OobTarget::StreamTypeAwareProvider && msg.service == OobService::HasVideo
            {
                msg.result = Some(OobResult::Flag(true));
            }
        }
    }

    impl Provider for Source {
        fn pull_message(&self, _pipe: &Pipe) -> Result<Option<RtmpEvent>> {
            Ok(self.queue.lock().pop_front())
        }
    }

    #[test]
    fn test_push_fan_out() {
        let pipe = Pipe::push_push();
        let a = Sink::new();
        let b = Sink::new();
        assert!(pipe.subscribe_consumer(a.clone()));
        assert!(pipe.subscribe_consumer(b.clone()));

        let msg = PipeMessage::Rtmp(RtmpEvent::audio(10, Bytes::from_static(&[0xAF])));
        pipe.push_message(&msg).unwrap();

        assert_eq!(a.received.lock().len(), 1);
        assert_eq!(b.received.lock().len(), 1);
    }

    #[test]
    fn test_duplicate_subscribe_refused() {
        let pipe = Pipe::push_push();
        let sink = Sink::new();
        assert!(pipe.subscribe_consumer(sink.clone()));
        assert!(!pipe.subscribe_consumer(sink.clone()));
        assert_eq!(pipe.consumer_count(), 1);
    }

    #[test]
    fn test_connection_events() {
        let pipe = Pipe::push_push();
        let sink = Sink::new();
        pipe.subscribe_consumer(sink.clone());

        let source = Source::with(vec![]);
        pipe.subscribe_provider(source.clone());
        pipe.unsubscribe_provider(source.id);
        assert!(pipe.unsubscribe_consumer(sink.id));
        assert!(!pipe.unsubscribe_consumer(sink.id));

        let events = sink.events.lock().clone();
        assert_eq!(
            events,
            vec![
                PipeConnectionEvent::ConsumerConnectPush(sink.id),
                PipeConnectionEvent::ProviderConnectPush(source.id),
                PipeConnectionEvent::ProviderDisconnect(source.id),
                PipeConnectionEvent::ConsumerDisconnect(sink.id),
            ]
        );
    }

    #[test]
    fn test_io_error_propagates() {
        let pipe = Pipe::push_push();
        pipe.subscribe_consumer(Sink::failing());
        let healthy = Sink::new();
        pipe.subscribe_consumer(healthy.clone());

        let msg = PipeMessage::Reset;
        assert!(pipe.push_message(&msg).is_err());
        assert!(healthy.received.lock().is_empty());
    }

    #[test]
    fn test_pull_first_available_provider() {
        let pipe = Pipe::pull_pull();
        let empty = Source::with(vec![]);
        let full = Source::with(vec![RtmpEvent::audio(5, Bytes::new())]);
        pipe.subscribe_provider(empty);
        pipe.subscribe_provider(full);

        let msg = pipe.pull_message().unwrap().unwrap();
        assert_eq!(msg.timestamp, 5);
        assert!(pipe.pull_message().unwrap().is_none());
        assert!(pipe
            .pull_message_timeout(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_oob_reaches_providers() {
        let pipe = Pipe::pull_pull();
        pipe.subscribe_provider(Source::with(vec![]));

        let mut msg = OobControlMessage::new(OobTarget::StreamTypeAwareProvider, OobService::HasVideo);
        pipe.send_oob_to_providers(&mut msg);
        assert_eq!(msg.flag(), Some(true));
    }

    #[test]
    fn test_push_ignored_on_pull_pipe() {
        let pipe = Pipe::pull_pull();
        let sink = Sink::new();
        pipe.subscribe_consumer(sink.clone());
        pipe.push_message(&PipeMessage::Reset).unwrap();
        assert!(sink.received.lock().is_empty());
        assert_eq!(
            sink.events.lock()[0],
            PipeConnectionEvent::ConsumerConnectPull(sink.id)
        );
    }
}
