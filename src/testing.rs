//! Test doubles shared by the unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::bandwidth::SimpleBandwidthControlService;
use crate::connection::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ConsumerService, Outbound,
    StreamConnection,
};
use crate::error::Result;
use crate::messaging::{RtmpEvent, StatusCode};
use crate::registry::{
    DefaultStreamFilenameGenerator, MemoryFileStore, ProviderService, StreamableFileFactory,
};
use crate::scheduling::{Clock, Job, JobId, Scheduler};
use crate::stream::{
    ClientBroadcastStream, EngineConfig, HandlerResult, PlayItem, PlaylistSubscriberStream,
    StreamAwareHandler, StreamInfo, StreamListener, StreamScope, StreamServices,
};

#[derive(Default)]
struct ManualState {
    now: i64,
    jobs: BTreeMap<(i64, JobId), Job>,
}

/// Scheduler and clock driven by hand
///
/// Time only moves in [`advance`](ManualScheduler::advance); due jobs run in
/// order of due time, with the clock set to each job's due time.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move the clock forward, running every job that falls due
    pub fn advance(&self, ms: i64) {
        let target = self.state.lock().now + ms;
        loop {
            let job = {
                let mut state = self.state.lock();
                let due = state
                    .jobs
                    .keys()
                    .next()
                    .copied()
                    .filter(|(at, _)| *at <= target);
                match due {
                    Some(key) => {
                        state.now = state.now.max(key.0);
                        state.jobs.remove(&key)
                    }
                    None => None,
                }
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        self.state.lock().now = target;
    }

    pub fn pending_jobs(&self) -> usize {
        self.state.lock().jobs.len()
    }
}

impl Scheduler for ManualScheduler {
    fn add_scheduled_once_job(&self, delay: Duration, job: Job) -> JobId {
        let id = JobId::next();
        let mut state = self.state.lock();
        let due = state.now + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        state.jobs.insert((due, id), job);
        id
    }

    fn remove_scheduled_job(&self, id: JobId) {
        let mut state = self.state.lock();
        let key = state.jobs.keys().find(|(_, job)| *job == id).copied();
        if let Some(key) = key {
            state.jobs.remove(&key);
        }
    }
}

impl Clock for ManualScheduler {
    fn now_ms(&self) -> i64 {
        self.state.lock().now
    }
}

/// Connection that keeps everything written to it
pub struct RecordingConnection {
    id: ConnectionId,
    written: Mutex<Vec<(u32, Outbound)>>,
    written_bytes: AtomicU64,
    pending: AtomicU64,
    pending_video: AtomicU64,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            written: Mutex::new(Vec::new()),
            written_bytes: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            pending_video: AtomicU64::new(0),
        })
    }

    pub fn outbound(&self, stream_id: u32) -> Vec<Outbound> {
        self.written
            .lock()
            .iter()
            .filter(|(id, _)| *id == stream_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn statuses(&self, stream_id: u32) -> Vec<StatusCode> {
        self.outbound(stream_id)
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Status(status) => Some(status.code),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self, stream_id: u32) -> Vec<RtmpEvent> {
        self.outbound(stream_id)
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Queue depths reported to play engines
    pub fn set_pending(&self, total: u64, video: u64) {
        self.pending.store(total, Ordering::SeqCst);
        self.pending_video.store(video, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.written.lock().clear();
    }
}

impl StreamConnection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn pending_messages(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    fn pending_video_messages(&self, _stream_id: u32) -> u64 {
        self.pending_video.load(Ordering::SeqCst)
    }

    fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::SeqCst)
    }

    fn client_bytes_read(&self) -> u64 {
        self.written_bytes.load(Ordering::SeqCst)
    }

    fn write(&self, stream_id: u32, message: Outbound) -> Result<()> {
        if let Outbound::Event(event) = &message {
            self.written_bytes
                .fetch_add(event.size() as u64, Ordering::SeqCst);
        }
        self.written.lock().push((stream_id, message));
        Ok(())
    }
}

/// Handler remembering which callbacks ran
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingHandler {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &'static str) -> HandlerResult {
        self.calls.lock().push(call);
        Ok(())
    }
}

impl StreamAwareHandler for RecordingHandler {
    fn publish_start(&self, _stream: &StreamInfo) -> HandlerResult {
        self.record("publish_start")
    }

    fn record_start(&self, _stream: &StreamInfo) -> HandlerResult {
        self.record("record_start")
    }

    fn broadcast_start(&self, _stream: &StreamInfo) -> HandlerResult {
        self.record("broadcast_start")
    }

    fn broadcast_close(&self, _stream: &StreamInfo) -> HandlerResult {
        self.record("broadcast_close")
    }

    fn subscriber_start(&self, _stream: &StreamInfo) -> HandlerResult {
        self.record("subscriber_start")
    }

    fn subscriber_close(&self, _stream: &StreamInfo) -> HandlerResult {
        self.record("subscriber_close")
    }

    fn playlist_item_play(&self, _stream: &StreamInfo, _item: &PlayItem, _is_live: bool) -> HandlerResult {
        self.record("playlist_item_play")
    }

    fn playlist_item_stop(&self, _stream: &StreamInfo, _item: &PlayItem) -> HandlerResult {
        self.record("playlist_item_stop")
    }

    fn vod_item_pause(&self, _stream: &StreamInfo, _item: &PlayItem, _position: i64) -> HandlerResult {
        self.record("vod_item_pause")
    }

    fn vod_item_resume(&self, _stream: &StreamInfo, _item: &PlayItem, _position: i64) -> HandlerResult {
        self.record("vod_item_resume")
    }

    fn vod_item_seek(&self, _stream: &StreamInfo, _item: &PlayItem, _position: i64) -> HandlerResult {
        self.record("vod_item_seek")
    }
}

/// Listener counting the packets it saw
#[derive(Default)]
pub struct CountingListener {
    packets: AtomicUsize,
}

impl CountingListener {
    pub fn count(&self) -> usize {
        self.packets.load(Ordering::SeqCst)
    }
}

impl StreamListener for CountingListener {
    fn packet_received(&self, _stream: &StreamInfo, _packet: &RtmpEvent) -> HandlerResult {
        self.packets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One application scope wired to a manual scheduler, in-memory files and a
/// single recording connection
pub struct Fixture {
    pub scheduler: Arc<ManualScheduler>,
    pub connection: Arc<RecordingConnection>,
    pub files: Arc<MemoryFileStore>,
    pub bandwidth: Arc<SimpleBandwidthControlService>,
    pub handler: Arc<RecordingHandler>,
    pub scope: Arc<StreamScope>,
    pub registry: Arc<ConnectionRegistry>,
    pub handle: ConnectionHandle,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(EngineConfig::default(), None)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Files are served by `factory`; `files` stays empty
    pub fn with_file_factory(factory: Arc<dyn StreamableFileFactory>) -> Self {
        Self::build(EngineConfig::default(), Some(factory))
    }

    fn build(config: EngineConfig, factory: Option<Arc<dyn StreamableFileFactory>>) -> Self {
        init_tracing();
        let scheduler = ManualScheduler::new();
        let files = MemoryFileStore::new();
        let factory = factory.unwrap_or_else(|| files.clone() as Arc<dyn StreamableFileFactory>);
        let bandwidth = Arc::new(SimpleBandwidthControlService::new());
        let services = StreamServices {
            scheduler: scheduler.clone(),
            clock: scheduler.clone(),
            providers: ProviderService::new(factory, Arc::new(DefaultStreamFilenameGenerator)),
            consumers: ConsumerService::new(),
            bandwidth: bandwidth.clone(),
            engine_config: config,
        };
        let scope = StreamScope::new("live", services);
        let handler = Arc::new(RecordingHandler::default());
        scope.set_handler(Some(handler.clone()));

        let registry = ConnectionRegistry::new();
        let connection = RecordingConnection::new();
        let dyn_connection: Arc<dyn StreamConnection> = connection.clone();
        let handle = registry.register(&dyn_connection);

        Self {
            scheduler,
            connection,
            files,
            bandwidth,
            handler,
            scope,
            registry,
            handle,
        }
    }

    pub fn providers(&self) -> &Arc<ProviderService> {
        &self.scope.services().providers
    }

    /// Started subscriber on `stream_id`
    pub fn subscriber(&self, stream_id: u32) -> Arc<PlaylistSubscriberStream> {
        let stream = PlaylistSubscriberStream::new(stream_id, self.scope.clone(), self.handle.clone());
        stream.start().unwrap();
        stream
    }

    /// Publisher live on `name`
    pub fn publisher(&self, stream_id: u32, name: &str) -> Arc<ClientBroadcastStream> {
        let stream = ClientBroadcastStream::new(stream_id, self.scope.clone(), self.handle.clone());
        stream.set_published_name(name);
        stream.start();
        stream.start_publishing().unwrap();
        stream
    }
}
