//! Client broadcast stream: one publisher feeding a live scope
//!
//! Incoming events arrive with per-channel timestamps that may be relative
//! to the previous event of the same channel. The stream keeps one running
//! absolute time per channel (audio, video, data) and stamps every event it
//! forwards with it. Accepted events go to the live pipe of the broadcast
//! scope and, while recording, to a record pipe feeding a [`FileConsumer`].
//!
//! Pipes are never called with the stream's lock held: subscribers react to
//! pushes and connection events synchronously and may call back in.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{Error, Result};
use crate::media::{StreamCodecInfo, VideoCodecFactory};
use crate::messaging::{
    EndpointId, EventBody, MessageComponent, OobControlMessage, OobService, OobTarget, Pipe,
    PipeConnectionEvent, PipeMessage, Provider, RtmpEvent, Status, StatusCode,
};
use crate::registry::{BroadcastScope, FileConsumer, RecordMode};
use crate::stats::{BroadcastStats, StatisticsCounter};

use super::context::StreamScope;
use super::handler::{log_failure, StreamInfo, StreamKind, StreamListener};

/// Video timestamps this far behind the other channels are accepted as is
const VIDEO_TIME_TOLERANCE_MS: i64 = 20;

struct Recording {
    path: String,
    consumer: EndpointId,
}

struct BroadcastState {
    published_name: Option<String>,
    live: Option<Arc<BroadcastScope>>,
    recording: Option<Recording>,
    send_start_notification: bool,
    check_video_codec: bool,
    closed: bool,

    audio_time: i64,
    video_time: i64,
    data_time: i64,
    first_packet_time: Option<i64>,
    min_stream_time: i64,

    bytes_received: u64,
    audio_frames: u64,
    video_frames: u64,
    keyframes: u64,
}

impl BroadcastState {
    fn reset_timestamps(&mut self) {
        self.audio_time = -1;
        self.video_time = -1;
        self.data_time = -1;
        self.first_packet_time = None;
    }

    fn current_timestamp(&self) -> i64 {
        self.audio_time.max(self.video_time).max(self.data_time)
    }
}

/// Advance a channel clock by an event timestamp
fn advance_clock(clock: &mut i64, event: &RtmpEvent, channel: &'static str) {
    if event.relative {
        if *clock <= 0 {
            tracing::warn!(channel = channel, timestamp = event.timestamp, "First timestamp is relative");
        }
        *clock = (*clock).max(0) + event.timestamp;
    } else {
        *clock = event.timestamp;
    }
}

/// Stream published by a client
pub struct ClientBroadcastStream {
    stream_id: u32,
    endpoint: EndpointId,
    scope: Arc<StreamScope>,
    connection: ConnectionHandle,
    msg_out: Arc<Pipe>,
    record_pipe: Arc<Pipe>,
    codec_info: Arc<StreamCodecInfo>,
    codec_factory: VideoCodecFactory,
    state: Mutex<BroadcastState>,
    listeners: RwLock<Vec<Arc<dyn StreamListener>>>,
    subscribers: StatisticsCounter,
    chunk_size: AtomicU32,
    created_at: Instant,
}

impl ClientBroadcastStream {
    pub fn new(stream_id: u32, scope: Arc<StreamScope>, connection: ConnectionHandle) -> Arc<Self> {
        let msg_out = scope
            .services()
            .consumers
            .consumer_output(&connection, stream_id);
        Arc::new(Self {
            stream_id,
            endpoint: EndpointId::next(),
            scope,
            connection,
            msg_out,
            record_pipe: Arc::new(Pipe::push_push()),
            codec_info: StreamCodecInfo::new(),
            codec_factory: VideoCodecFactory::new(),
            state: Mutex::new(BroadcastState {
                published_name: None,
                live: None,
                recording: None,
                send_start_notification: true,
                check_video_codec: true,
                closed: false,
                audio_time: -1,
                video_time: -1,
                data_time: -1,
                first_packet_time: None,
                min_stream_time: 0,
                bytes_received: 0,
                audio_frames: 0,
                video_frames: 0,
                keyframes: 0,
            }),
            listeners: RwLock::new(Vec::new()),
            subscribers: StatisticsCounter::new(),
            chunk_size: AtomicU32::new(0),
            created_at: Instant::now(),
        })
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn published_name(&self) -> Option<String> {
        self.state.lock().published_name.clone()
    }

    pub fn set_published_name(&self, name: impl Into<String>) {
        let name = name.into();
        tracing::debug!(stream_id = self.stream_id, name = %name, "Published name set");
        self.state.lock().published_name = Some(name);
    }

    pub fn codec_info(&self) -> &Arc<StreamCodecInfo> {
        &self.codec_info
    }

    /// Lower bound for the video clock when a stale absolute timestamp
    /// arrives
    pub fn set_min_stream_time(&self, ms: i64) {
        self.state.lock().min_stream_time = ms;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording.is_some()
    }

    /// Storage path of the active recording
    pub fn save_filename(&self) -> Option<String> {
        self.state.lock().recording.as_ref().map(|r| r.path.clone())
    }

    pub fn current_timestamp(&self) -> i64 {
        self.state.lock().current_timestamp()
    }

    fn info(&self) -> StreamInfo {
        StreamInfo::new(self.stream_id, self.scope.app(), StreamKind::Broadcast)
            .with_connection(self.connection.id())
            .with_name(self.published_name())
    }

    /// Reset the channel clocks for a new publish session
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.reset_timestamps();
        state.check_video_codec = true;
    }

    /// Register under the published name and announce the publish
    ///
    /// Start notifications go out before the first packet; some encoders
    /// wait for them before sending anything.
    pub fn start_publishing(self: &Arc<Self>) -> Result<()> {
        let name = self
            .published_name()
            .ok_or_else(|| Error::illegal_state("publish", "unnamed"))?;
        let providers = &self.scope.services().providers;
        let provider: Arc<dyn Provider> = self.clone();
        if !providers.register_broadcast_stream(self.scope.app(), &name, provider) {
            return Err(Error::BadName(name));
        }
        match providers.live_provider_input(self.scope.app(), &name, false) {
            Some(scope) => self.attach_scope(scope),
            None => {
                tracing::warn!(stream_id = self.stream_id, name = %name, "Broadcast scope vanished after registration");
                return Err(Error::BadName(name));
            }
        }
        tracing::info!(stream_id = self.stream_id, connection = %self.connection.id(), name = %name, "Publishing started");
        self.send_start_notifications();
        Ok(())
    }

    /// Use `scope` as the live output and share codec facts with it
    pub fn attach_scope(&self, scope: Arc<BroadcastScope>) {
        scope.set_codec_info(Some(Arc::clone(&self.codec_info)));
        self.state.lock().live = Some(Arc::clone(&scope));
        self.notify_chunk_size(scope.pipe());
    }

    /// Outgoing chunk size announced to every subscriber
    pub fn set_chunk_size(&self, size: u32) {
        self.chunk_size.store(size, Ordering::Release);
        let live = self.state.lock().live.clone();
        if let Some(scope) = live {
            self.notify_chunk_size(scope.pipe());
        }
    }

    fn notify_chunk_size(&self, pipe: &Pipe) {
        let size = self.chunk_size.load(Ordering::Acquire);
        if size > 0 {
            let mut msg =
                OobControlMessage::new(OobTarget::ConnectionConsumer, OobService::ChunkSize(size));
            pipe.send_oob_to_consumers(&mut msg);
        }
    }

    fn send_start_notifications(&self) {
        let recording = {
            let mut state = self.state.lock();
            if !state.send_start_notification {
                return;
            }
            state.send_start_notification = false;
            state.recording.is_some()
        };
        let info = self.info();
        if recording {
            self.scope.notify("record_start", &info, |h, s| h.record_start(s));
        } else {
            self.scope.notify("publish_start", &info, |h, s| h.publish_start(s));
        }
        self.send_status(StatusCode::PublishStart, None);
        if recording {
            self.send_status(StatusCode::RecordStart, None);
        }
        self.scope
            .notify("broadcast_start", &info, |h, s| h.broadcast_start(s));
    }

    /// Accept one event from the publisher
    pub fn dispatch_event(&self, event: RtmpEvent) {
        let (event, live, recording) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.first_packet_time.is_none() {
                tracing::debug!(stream_id = self.stream_id, timestamp = event.timestamp, relative = event.relative, "First packet");
                state.first_packet_time = Some(event.timestamp);
            }
            state.bytes_received += event.size() as u64;

            let timestamp = match &event.body {
                EventBody::Audio(_) => {
                    self.codec_info.set_has_audio(true);
                    state.audio_frames += 1;
                    advance_clock(&mut state.audio_time, &event, "audio");
                    state.audio_time
                }
                EventBody::Video(data) => {
                    if state.check_video_codec {
                        state.check_video_codec = false;
                        if let Some(codec) = self.codec_factory.video_codec(data) {
                            tracing::debug!(stream_id = self.stream_id, codec = codec.name(), "Video codec selected");
                            self.codec_info.set_video_codec(codec);
                        }
                    }
                    self.codec_info.add_video_data(data);
                    self.codec_info.set_has_video(true);
                    state.video_frames += 1;
                    if event.is_keyframe() {
                        state.keyframes += 1;
                    }

                    advance_clock(&mut state.video_time, &event, "video");
                    if !event.relative {
                        // A stale absolute video time must not rewind the timebase
                        let floor = state
                            .audio_time
                            .max(state.data_time)
                            .max(state.min_stream_time);
                        if state.video_time + VIDEO_TIME_TOLERANCE_MS < floor {
                            tracing::debug!(stream_id = self.stream_id, from = state.video_time, to = floor, "Adjusting archaic video time");
                            state.video_time = floor;
                        }
                    }
                    state.video_time
                }
                EventBody::Invoke(_) => {
                    advance_clock(&mut state.data_time, &event, "data");
                    return;
                }
                EventBody::Notify(_) => {
                    advance_clock(&mut state.data_time, &event, "data");
                    state.data_time
                }
                EventBody::PlayStatus(_) | EventBody::Ping(_) => {
                    tracing::debug!(stream_id = self.stream_id, "Ignoring control event from publisher");
                    return;
                }
            };

            let mut event = event;
            event.timestamp = timestamp;
            event.relative = false;
            (event, state.live.clone(), state.recording.is_some())
        };

        self.send_start_notifications();

        let message = PipeMessage::Rtmp(event.clone());
        if let Some(scope) = live {
            if let Err(e) = scope.push_message(&message) {
                tracing::warn!(stream_id = self.stream_id, error = %e, "Failed to push to live subscribers");
            }
        }
        if recording {
            if let Err(e) = self.record_pipe.push_message(&message) {
                tracing::error!(stream_id = self.stream_id, error = %e, "Recording failed");
                self.send_status(StatusCode::RecordFailed, Some(e.to_string()));
                self.stop_recording();
            }
        }

        let listeners = self.listeners.read().clone();
        if !listeners.is_empty() {
            let info = self.info();
            for listener in listeners {
                log_failure("packet_received", &info, listener.packet_received(&info, &event));
            }
        }
    }

    /// Record everything published from now on into `name`
    ///
    /// Append mode falls back to a fresh recording when no file exists yet.
    pub fn save_as(self: &Arc<Self>, name: &str, append: bool) -> Result<()> {
        let providers = &self.scope.services().providers;
        let path = providers.record_path(self.scope.app(), name);
        let factory = providers.file_factory();
        let mode = if append && factory.open(&path).is_some() {
            RecordMode::Append
        } else {
            RecordMode::Record
        };
        let file = factory.create(&path)?;

        self.stop_recording();
        let provider: Arc<dyn Provider> = self.clone();
        self.record_pipe.subscribe_provider(provider);
        let consumer = FileConsumer::new(path.clone(), file, mode);
        let id = consumer.endpoint_id();
        self.record_pipe.subscribe_consumer(consumer);

        tracing::info!(stream_id = self.stream_id, path = %path, mode = ?mode, "Recording started");
        self.state.lock().recording = Some(Recording { path, consumer: id });
        Ok(())
    }

    /// Stop recording, closing the file
    pub fn stop_recording(&self) {
        let recording = self.state.lock().recording.take();
        if let Some(recording) = recording {
            self.record_pipe.unsubscribe_consumer(recording.consumer);
            tracing::info!(stream_id = self.stream_id, path = %recording.path, "Recording stopped");
        }
    }

    pub fn add_stream_listener(&self, listener: Arc<dyn StreamListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_stream_listener(&self, listener: &Arc<dyn StreamListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn stream_listeners(&self) -> Vec<Arc<dyn StreamListener>> {
        self.listeners.read().clone()
    }

    pub fn statistics(&self) -> BroadcastStats {
        let state = self.state.lock();
        let mut stats = BroadcastStats::new(self.created_at);
        stats.name = state.published_name.clone();
        stats.bytes_received = state.bytes_received;
        stats.audio_frames = state.audio_frames;
        stats.video_frames = state.video_frames;
        stats.keyframes = state.keyframes;
        stats.current_timestamp = state.current_timestamp();
        stats.active_subscribers = self.subscribers.current();
        stats.max_subscribers = self.subscribers.max();
        stats.total_subscribers = self.subscribers.total();
        stats.video_codec = self.codec_info.video_codec_name();
        stats
    }

    /// Stop publishing for good
    pub fn close(&self) {
        let (live, recording) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.live.take(), state.recording.take())
        };

        if let Some(scope) = live {
            scope.unsubscribe_provider(self.endpoint);
        }
        self.record_pipe.unsubscribe_provider(self.endpoint);
        if recording.is_some() {
            self.send_status(StatusCode::RecordStop, None);
        }
        self.send_status(StatusCode::UnpublishSuccess, None);

        let info = self.info();
        tracing::info!(stream_id = self.stream_id, connection = %self.connection.id(), name = ?info.name, "Broadcast stream closed");
        self.scope
            .notify("broadcast_close", &info, |h, s| h.broadcast_close(s));
    }

    fn send_status(&self, code: StatusCode, description: Option<String>) {
        let mut status = Status::new(code, self.stream_id)
            .details(self.published_name().unwrap_or_default());
        if let Some(description) = description {
            status = status.description(description);
        }
        if let Err(e) = self.msg_out.push_message(&PipeMessage::Status(status)) {
            tracing::error!(stream_id = self.stream_id, error = %e, "Failed to send status");
        }
    }
}

impl MessageComponent for ClientBroadcastStream {
    fn endpoint_id(&self) -> EndpointId {
        self.endpoint
    }

    fn on_pipe_connection_event(&self, pipe: &Pipe, event: &PipeConnectionEvent) {
        if std::ptr::eq(pipe, self.record_pipe.as_ref()) {
            return;
        }
        match event {
            PipeConnectionEvent::ProviderConnectPush(id) if *id == self.endpoint => {
                for _ in 0..pipe.consumer_count() {
                    self.subscribers.increment();
                }
            }
            PipeConnectionEvent::ConsumerConnectPush(_) => {
                self.notify_chunk_size(pipe);
                self.subscribers.increment();
            }
            PipeConnectionEvent::ConsumerDisconnect(_) => self.subscribers.decrement(),
            _ => {}
        }
    }
}

impl Provider for ClientBroadcastStream {}

impl std::fmt::Debug for ClientBroadcastStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBroadcastStream")
            .field("stream_id", &self.stream_id)
            .field("connection", &self.connection.id())
            .finish()
    }
}
