//! Server-side playlist broadcast
//!
//! A [`ServerStream`] publishes a playlist under a name of its own. Clients
//! subscribe to it like to any live stream. VOD items are paced against the
//! clock with the same delta scheduling as subscriber playback; live items
//! are relayed as they arrive and, when they have a length, end on a timer.
//! The playlist advances on its own when an item ends.
//!
//! The stream's lock is held while it pushes to its output. Its own pipe
//! callbacks never take that lock.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::messaging::{
    Consumer, EndpointId, MessageComponent, OobControlMessage, OobService, OobTarget, Pipe,
    PipeMessage, Provider, RtmpEvent,
};
use crate::registry::{BroadcastScope, FileConsumer, RecordMode};
use crate::scheduling::{delay_ms, JobId};

use super::context::StreamScope;
use super::handler::{log_failure, StreamInfo, StreamKind, StreamListener};
use super::playlist::{Playlist, PlaylistController};
use super::state::{PlayItem, StreamState};

/// Messages due this many milliseconds from now or earlier are sent at once
const WAIT_THRESHOLD_MS: i64 = 0;

enum ServerInput {
    Vod(Arc<Pipe>),
    Live(Arc<BroadcastScope>),
}

struct Recording {
    path: String,
    consumer: EndpointId,
}

struct ServerState {
    state: StreamState,
    published_name: Option<String>,
    playlist: Playlist,
    current_item: Option<PlayItem>,
    input: Option<ServerInput>,
    output: Option<Arc<BroadcastScope>>,
    recording: Option<Recording>,

    item_job: Option<JobId>,
    item_generation: u64,
    vod_job: Option<JobId>,
    vod_generation: u64,

    /// Timestamp of the first message of the current timeline
    vod_start_ts: i64,
    /// Clock time the current timeline started at
    server_start_ts: i64,
    /// Take `vod_start_ts` from the next pulled message
    rebase: bool,
    next_message: Option<RtmpEvent>,
}

/// Playlist broadcast owned by the server
pub struct ServerStream {
    endpoint: EndpointId,
    scope: Arc<StreamScope>,
    record_pipe: Arc<Pipe>,
    owner: Weak<ServerStream>,
    state: Mutex<ServerState>,
    listeners: RwLock<Vec<Arc<dyn StreamListener>>>,
    created_at: Instant,
}

impl ServerStream {
    pub fn new(scope: Arc<StreamScope>) -> Arc<Self> {
        Arc::new_cyclic(|owner| Self {
            endpoint: EndpointId::next(),
            scope,
            record_pipe: Arc::new(Pipe::push_push()),
            owner: owner.clone(),
            state: Mutex::new(ServerState {
                state: StreamState::Uninit,
                published_name: None,
                playlist: Playlist::new(),
                current_item: None,
                input: None,
                output: None,
                recording: None,
                item_job: None,
                item_generation: 0,
                vod_job: None,
                vod_generation: 0,
                vod_start_ts: 0,
                server_start_ts: 0,
                rebase: true,
                next_message: None,
            }),
            listeners: RwLock::new(Vec::new()),
            created_at: Instant::now(),
        })
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> StreamState {
        self.state.lock().state
    }

    pub fn published_name(&self) -> Option<String> {
        self.state.lock().published_name.clone()
    }

    pub fn set_published_name(&self, name: impl Into<String>) {
        self.state.lock().published_name = Some(name.into());
    }

    // ----- playlist -----

    pub fn add_item(&self, item: PlayItem) {
        self.state.lock().playlist.add_item(item);
    }

    pub fn add_item_at(&self, item: PlayItem, index: usize) {
        self.state.lock().playlist.add_item_at(item, index);
    }

    pub fn remove_item(&self, index: usize) -> Option<PlayItem> {
        self.state.lock().playlist.remove_item(index)
    }

    pub fn remove_all_items(&self) {
        self.state.lock().playlist.clear();
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().playlist.len()
    }

    pub fn item(&self, index: usize) -> Option<PlayItem> {
        self.state.lock().playlist.item(index).cloned()
    }

    pub fn current_item_index(&self) -> Option<usize> {
        self.state.lock().playlist.current_index()
    }

    /// Item being broadcast
    pub fn current_item(&self) -> Option<PlayItem> {
        self.state.lock().current_item.clone()
    }

    pub fn has_more_items(&self) -> bool {
        self.state.lock().playlist.has_more_items()
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.state.lock().playlist.set_repeat(repeat);
    }

    pub fn set_rewind(&self, rewind: bool) {
        self.state.lock().playlist.set_rewind(rewind);
    }

    pub fn set_random(&self, random: bool) {
        self.state.lock().playlist.set_random(random);
    }

    pub fn set_playlist_controller(&self, controller: Option<Arc<dyn PlaylistController>>) {
        self.state.lock().playlist.set_controller(controller);
    }

    pub fn next_item(&self) {
        let mut st = self.state.lock();
        self.move_to_next(&mut st);
    }

    pub fn previous_item(&self) {
        let mut st = self.state.lock();
        self.stop_item(&mut st);
        if let Some(index) = st.playlist.move_previous() {
            self.play_index(&mut st, index);
        }
    }

    /// Jump to `index`; out of range indexes are ignored
    pub fn set_item(&self, index: usize) {
        let mut st = self.state.lock();
        if index >= st.playlist.len() {
            return;
        }
        self.stop_item(&mut st);
        st.playlist.set_current_index(Some(index));
        self.play_index(&mut st, index);
    }

    // ----- lifecycle -----

    /// Register under the published name and play the first item
    pub fn start(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.state != StreamState::Uninit {
            return Err(Error::illegal_state("start", st.state.as_str()));
        }
        if st.playlist.is_empty() {
            return Err(Error::NoPlaylistItems);
        }
        let name = st
            .published_name
            .clone()
            .ok_or_else(|| Error::illegal_state("start", "unnamed"))?;
        let Some(me) = self.owner.upgrade() else {
            return Err(Error::Closed);
        };

        let providers = &self.scope.services().providers;
        let app = self.scope.app();
        if !providers.register_broadcast_stream(app, &name, me.clone()) {
            return Err(Error::BadName(name));
        }
        st.output = providers.live_provider_input(app, &name, false);
        self.record_pipe.subscribe_provider(me);

        tracing::info!(app = %app, name = %name, items = st.playlist.len(), "Server stream started");
        st.state = StreamState::Stopped;
        st.playlist.set_current_index(None);
        self.move_to_next(&mut st);
        Ok(())
    }

    /// Stop the current item without advancing
    pub fn stop(&self) {
        let mut st = self.state.lock();
        self.stop_item(&mut st);
        self.cancel_item_job(&mut st);
    }

    /// Toggle between playing and paused
    ///
    /// Resuming restarts the wall-clock base at the held message.
    pub fn pause(&self) {
        let mut st = self.state.lock();
        match st.state {
            StreamState::Playing => {
                st.state = StreamState::Paused;
                self.cancel_vod_job(&mut st);
                tracing::debug!(name = ?st.published_name, "Server stream paused");
            }
            StreamState::Paused => {
                st.state = StreamState::Playing;
                self.restart_timeline(&mut st);
                tracing::debug!(name = ?st.published_name, "Server stream resumed");
                if matches!(st.input, Some(ServerInput::Vod(_))) {
                    self.schedule_next_message(&mut st);
                }
            }
            _ => {}
        }
    }

    /// Move a VOD item to `position`
    pub fn seek(&self, position: i64) -> Result<()> {
        let mut st = self.state.lock();
        if !matches!(st.state, StreamState::Playing | StreamState::Paused) {
            return Err(Error::illegal_state("seek", st.state.as_str()));
        }
        let pipe = match &st.input {
            Some(ServerInput::Vod(pipe)) => Arc::clone(pipe),
            _ => return Err(Error::NotSupported("seek on a live item")),
        };

        let mut msg = OobControlMessage::new(OobTarget::SeekableProvider, OobService::Seek { position });
        pipe.send_oob_to_providers(&mut msg);
        tracing::debug!(position = position, snapped = ?msg.position(), "Server stream seek");

        self.cancel_vod_job(&mut st);
        if let Some(message) = st.next_message.take() {
            self.push_out(&mut st, PipeMessage::Rtmp(message));
        }
        self.push_out(&mut st, PipeMessage::Reset);
        self.restart_timeline(&mut st);
        if st.state == StreamState::Playing {
            self.schedule_next_message(&mut st);
        }
        Ok(())
    }

    /// Stop broadcasting for good
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.state == StreamState::Closed {
            return;
        }
        self.stop_item(&mut st);
        self.cancel_item_job(&mut st);
        if let Some(output) = st.output.take() {
            output.unsubscribe_provider(self.endpoint);
        }
        self.record_pipe.unsubscribe_provider(self.endpoint);
        st.recording = None;
        st.state = StreamState::Closed;

        let info = self.info(&st);
        tracing::info!(name = ?info.name, "Server stream closed");
        self.scope
            .notify("broadcast_close", &info, |h, s| h.broadcast_close(s));
    }

    // ----- recording -----

    /// Record the broadcast into `name`
    pub fn save_as(&self, name: &str, append: bool) -> Result<()> {
        let providers = &self.scope.services().providers;
        let path = providers.record_path(self.scope.app(), name);
        let factory = providers.file_factory();
        let mode = if append && factory.open(&path).is_some() {
            RecordMode::Append
        } else {
            RecordMode::Record
        };
        let file = factory.create(&path)?;

        let mut st = self.state.lock();
        self.stop_recording(&mut st);
        if let Some(me) = self.owner.upgrade() {
            self.record_pipe.subscribe_provider(me);
        }
        let consumer = FileConsumer::new(path.clone(), file, mode);
        let id = consumer.endpoint_id();
        self.record_pipe.subscribe_consumer(consumer);
        tracing::info!(path = %path, mode = ?mode, "Server stream recording");
        st.recording = Some(Recording { path, consumer: id });
        Ok(())
    }

    pub fn save_filename(&self) -> Option<String> {
        self.state.lock().recording.as_ref().map(|r| r.path.clone())
    }

    fn stop_recording(&self, st: &mut ServerState) {
        if let Some(recording) = st.recording.take() {
            self.record_pipe.unsubscribe_consumer(recording.consumer);
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

    // ----- items -----

    fn info(&self, st: &ServerState) -> StreamInfo {
        StreamInfo::new(0, self.scope.app(), StreamKind::Server)
            .with_name(st.published_name.clone())
    }

    fn move_to_next(&self, st: &mut ServerState) {
        self.stop_item(st);
        match st.playlist.move_next() {
            Some(index) => self.play_index(st, index),
            None => tracing::debug!(name = ?st.published_name, "Server playlist finished"),
        }
    }

    fn play_index(&self, st: &mut ServerState, index: usize) {
        if let Some(item) = st.playlist.item(index).cloned() {
            self.play_item(st, item);
        }
    }

    fn play_item(&self, st: &mut ServerState, item: PlayItem) {
        if st.state != StreamState::Stopped {
            return;
        }
        let Some(me) = self.owner.upgrade() else {
            return;
        };
        let providers = &self.scope.services().providers;
        let app = self.scope.app();

        let input = if let Some(pipe) = providers.vod_provider_input(app, &item.name) {
            pipe.subscribe_consumer(me);
            ServerInput::Vod(pipe)
        } else if let Some(scope) = providers.live_provider_input(app, &item.name, true) {
            scope.subscribe_consumer(me);
            ServerInput::Live(scope)
        } else {
            tracing::warn!(item = %item.name, "No VOD or live input for server stream item");
            return;
        };

        tracing::info!(name = ?st.published_name, item = %item.name, "Server stream item started");
        st.state = StreamState::Playing;
        st.current_item = Some(item.clone());
        self.push_out(st, PipeMessage::Reset);

        match &input {
            ServerInput::Live(_) => {
                st.input = Some(input);
                if item.length >= 0 {
                    self.schedule_item_end(st, item.length);
                }
            }
            ServerInput::Vod(pipe) => {
                let mut init = OobControlMessage::new(
                    OobTarget::Passive,
                    OobService::Init {
                        start_ts: item.start.max(0),
                    },
                );
                pipe.send_oob_to_providers(&mut init);
                if item.start > 0 {
                    let mut seek = OobControlMessage::new(
                        OobTarget::SeekableProvider,
                        OobService::Seek {
                            position: item.start,
                        },
                    );
                    pipe.send_oob_to_providers(&mut seek);
                }
                st.input = Some(input);
                self.start_broadcast_vod(st);
            }
        }
    }

    fn start_broadcast_vod(&self, st: &mut ServerState) {
        st.next_message = None;
        self.restart_timeline(st);

        let info = self.info(st);
        if st.recording.is_some() {
            self.scope.notify("record_start", &info, |h, s| h.record_start(s));
        } else {
            self.scope.notify("publish_start", &info, |h, s| h.publish_start(s));
        }
        self.scope
            .notify("broadcast_start", &info, |h, s| h.broadcast_start(s));
        self.schedule_next_message(st);
    }

    /// Unsubscribe the input and forget the held message
    fn stop_item(&self, st: &mut ServerState) {
        if !matches!(st.state, StreamState::Playing | StreamState::Paused) {
            return;
        }
        self.cancel_vod_job(st);
        self.cancel_item_job(st);
        match st.input.take() {
            Some(ServerInput::Vod(pipe)) => {
                pipe.unsubscribe_consumer(self.endpoint);
            }
            Some(ServerInput::Live(scope)) => {
                scope.unsubscribe_consumer(self.endpoint);
            }
            None => {}
        }
        st.next_message = None;
        st.state = StreamState::Stopped;
    }

    /// Stop the item and move on from a fresh job
    fn end_item(&self, st: &mut ServerState) {
        tracing::debug!(item = ?st.current_item.as_ref().map(|i| &i.name), "Server stream item ended");
        self.stop_item(st);
        self.schedule_item_end(st, 0);
    }

    fn restart_timeline(&self, st: &mut ServerState) {
        st.server_start_ts = self.scope.services().clock.now_ms();
        match &st.next_message {
            Some(message) => {
                st.vod_start_ts = message.timestamp;
                st.rebase = false;
            }
            None => st.rebase = true,
        }
    }

    // ----- VOD pacing -----

    /// Send every message that is due, then arm a job for the next one
    fn schedule_next_message(&self, st: &mut ServerState) {
        loop {
            if st.next_message.is_none() {
                match self.pull_next(st) {
                    Some(message) => {
                        if st.rebase {
                            st.vod_start_ts = message.timestamp;
                            st.rebase = false;
                        }
                        st.next_message = Some(message);
                    }
                    None => {
                        self.end_item(st);
                        return;
                    }
                }
            }
            let next_ts = st.next_message.as_ref().map(|m| m.timestamp).unwrap_or(0);
            let now = self.scope.services().clock.now_ms();
            let delta = next_ts - st.vod_start_ts - (now - st.server_start_ts);
            if delta > WAIT_THRESHOLD_MS {
                self.schedule_vod(st, delta);
                return;
            }
            if !self.send_next(st) || st.state != StreamState::Playing {
                return;
            }
        }
    }

    /// Next audio or video message from the VOD input
    fn pull_next(&self, st: &ServerState) -> Option<RtmpEvent> {
        let Some(ServerInput::Vod(pipe)) = &st.input else {
            return None;
        };
        loop {
            match pipe.pull_message() {
                Ok(Some(message)) if message.is_audio() || message.is_video() => {
                    return Some(message)
                }
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pull server stream message");
                    return None;
                }
            }
        }
    }

    fn send_next(&self, st: &mut ServerState) -> bool {
        let Some(item) = &st.current_item else {
            return false;
        };
        let start = item.start.max(0);
        let length = item.length;
        let next_ts = st.next_message.as_ref().map(|m| m.timestamp).unwrap_or(0);
        if length >= 0 && next_ts - start > length {
            self.end_item(st);
            return false;
        }
        match st.next_message.take() {
            Some(message) => {
                self.push_out(st, PipeMessage::Rtmp(message));
                true
            }
            None => false,
        }
    }

    fn push_out(&self, st: &mut ServerState, message: PipeMessage) {
        if let Some(output) = &st.output {
            if let Err(e) = output.push_message(&message) {
                tracing::warn!(error = %e, "Failed to push server stream message");
            }
        }
        if st.recording.is_some() {
            if let Err(e) = self.record_pipe.push_message(&message) {
                tracing::error!(error = %e, "Server stream recording failed");
                self.stop_recording(st);
            }
        }
        if let PipeMessage::Rtmp(event) = &message {
            let listeners = self.listeners.read().clone();
            if !listeners.is_empty() {
                let info = self.info(st);
                for listener in listeners {
                    log_failure("packet_received", &info, listener.packet_received(&info, event));
                }
            }
        }
    }

    // ----- jobs -----

    fn schedule_vod(&self, st: &mut ServerState, delay: i64) {
        self.cancel_vod_job(st);
        let generation = st.vod_generation;
        let owner = self.owner.clone();
        let id = self.scope.services().scheduler.add_scheduled_once_job(
            delay_ms(delay),
            Box::new(move || {
                if let Some(stream) = owner.upgrade() {
                    stream.run_vod_job(generation);
                }
            }),
        );
        st.vod_job = Some(id);
    }

    fn run_vod_job(&self, generation: u64) {
        let mut st = self.state.lock();
        if generation != st.vod_generation || st.vod_job.is_none() {
            return;
        }
        st.vod_job = None;
        if st.state == StreamState::Playing {
            self.schedule_next_message(&mut st);
        }
    }

    fn cancel_vod_job(&self, st: &mut ServerState) {
        st.vod_generation += 1;
        if let Some(id) = st.vod_job.take() {
            self.scope.services().scheduler.remove_scheduled_job(id);
        }
    }

    fn schedule_item_end(&self, st: &mut ServerState, delay: i64) {
        self.cancel_item_job(st);
        let generation = st.item_generation;
        let owner = self.owner.clone();
        let id = self.scope.services().scheduler.add_scheduled_once_job(
            delay_ms(delay),
            Box::new(move || {
                if let Some(stream) = owner.upgrade() {
                    stream.run_item_job(generation);
                }
            }),
        );
        st.item_job = Some(id);
    }

    fn run_item_job(&self, generation: u64) {
        let mut st = self.state.lock();
        if generation != st.item_generation || st.item_job.is_none() {
            return;
        }
        st.item_job = None;
        self.move_to_next(&mut st);
    }

    fn cancel_item_job(&self, st: &mut ServerState) {
        st.item_generation += 1;
        if let Some(id) = st.item_job.take() {
            self.scope.services().scheduler.remove_scheduled_job(id);
        }
    }
}

impl MessageComponent for ServerStream {
    fn endpoint_id(&self) -> EndpointId {
        self.endpoint
    }
}

impl Provider for ServerStream {}

impl Consumer for ServerStream {
    /// Relay a live item
    fn push_message(&self, _pipe: &Pipe, message: &PipeMessage) -> Result<()> {
        let mut st = self.state.lock();
        if st.state == StreamState::Playing && matches!(st.input, Some(ServerInput::Live(_))) {
            self.push_out(&mut st, message.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ServerStream")
            .field("name", &st.published_name)
            .field("state", &st.state)
            .field("items", &st.playlist.len())
            .finish()
    }
}
