//! Play engine: per-subscriber playback scheduling
//!
//! The engine decides where an item comes from and how it reaches the
//! client:
//!
//! - **Live** items subscribe to the broadcast scope in push mode. The
//!   publisher sets the cadence; the engine only drops video through the
//!   [`VideoFrameDropper`] and the bandwidth buckets when the client falls
//!   behind.
//! - **VOD** items subscribe to a pull pipe. The engine pulls one message
//!   at a time and paces it against the wall clock: a message stamped `t`
//!   goes out once `t` milliseconds of playback have elapsed. A message
//!   that cannot go out yet is parked in the single pending slot and the
//!   loop is re-armed through the scheduler.
//! - **Wait** items subscribe to an empty scope and wait for a publisher.
//!
//! All state lives behind the owning stream's mutex; scheduled jobs and
//! token callbacks re-enter through it.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::bandwidth::{BandwidthContext, TokenBucket, TokenBucketCallback};
use crate::connection::ConnectionHandle;
use crate::error::{Error, Result};
use crate::messaging::{
    Consumer, EndpointId, EventBody, OobControlMessage, OobService, OobTarget, Pipe, PingKind,
    PipeMessage, PlayStatus, RtmpEvent, Status, StatusCode,
};
use crate::registry::BroadcastScope;
use crate::scheduling::{delay_ms, JobId};
use crate::stats::PlaybackStats;

use super::context::StreamScope;
use super::dropper::{DropperState, VideoFrameDropper};
use super::handler::{StreamInfo, StreamKind};
use super::playlist::Playlist;
use super::state::{PlayItem, StreamState};
use super::subscriber::PlaylistSubscriberStream;

/// A VOD message is sent once it is due by more than this many milliseconds
const WAIT_THRESHOLD_MS: i64 = 0;

/// How much more than the client buffer may be queued ahead of playback
const CLIENT_BUFFER_HEADROOM: i64 = 2;

/// Where the current item's messages come from
#[derive(Clone)]
pub(crate) enum Input {
    Live(Arc<BroadcastScope>),
    Vod(Arc<Pipe>),
}

/// Source chosen for a play item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayDecision {
    Live,
    Vod,
    /// Subscribed to an empty scope until a publisher shows up
    Wait,
    NotFound,
}

#[derive(Debug, Clone, Copy)]
enum WaitJob {
    /// Publisher wait timed out, keep waiting without a deadline
    Timeout,
    /// The live item's length elapsed
    ItemEnd,
}

pub(crate) struct PlayEngine {
    stream_id: u32,
    scope: Arc<StreamScope>,
    owner: Weak<PlaylistSubscriberStream>,
    endpoint: EndpointId,
    connection: ConnectionHandle,
    msg_out: Arc<Pipe>,

    pub(crate) state: StreamState,
    pub(crate) playlist: Playlist,
    current_item: Option<PlayItem>,
    msg_in: Option<Input>,
    decision: PlayDecision,
    pull_mode: bool,

    receive_video: bool,
    receive_audio: bool,
    send_blank_audio: bool,

    waiting: bool,
    wait_job: Option<JobId>,
    wait_generation: u64,
    pull_job: Option<JobId>,
    pull_generation: u64,

    bw_context: Option<BandwidthContext>,
    audio_bucket: Option<Arc<dyn TokenBucket>>,
    video_bucket: Option<Arc<dyn TokenBucket>>,
    waiting_for_token: Arc<AtomicBool>,
    /// Tokens of the last refused request, as (video, amount)
    requested: Option<(bool, u64)>,
    /// Granted tokens not yet spent on a message
    prepaid: Option<(bool, u64)>,

    pending: Option<RtmpEvent>,
    dropper: VideoFrameDropper,
    /// Set when a write to the client failed with an I/O error
    output_failed: Cell<bool>,

    /// Added to VOD timestamps so playlist items continue one timeline
    timestamp_offset: i64,
    /// Source timestamp of the last VOD message sent
    last_local_ts: i64,
    /// Timestamp of the last message written to the client
    last_timestamp: Option<i64>,
    bytes_sent: u64,

    playback_start: i64,
    stream_offset: i64,
    next_check_buffer_underrun: i64,
    client_buffer: i64,
}

impl PlayEngine {
    pub(crate) fn new(
        stream_id: u32,
        scope: Arc<StreamScope>,
        owner: Weak<PlaylistSubscriberStream>,
        endpoint: EndpointId,
        connection: ConnectionHandle,
        msg_out: Arc<Pipe>,
        waiting_for_token: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream_id,
            scope,
            owner,
            endpoint,
            connection,
            msg_out,
            state: StreamState::Uninit,
            playlist: Playlist::new(),
            current_item: None,
            msg_in: None,
            decision: PlayDecision::NotFound,
            pull_mode: false,
            receive_video: true,
            receive_audio: true,
            send_blank_audio: false,
            waiting: false,
            wait_job: None,
            wait_generation: 0,
            pull_job: None,
            pull_generation: 0,
            bw_context: None,
            audio_bucket: None,
            video_bucket: None,
            waiting_for_token,
            requested: None,
            prepaid: None,
            pending: None,
            dropper: VideoFrameDropper::new(),
            output_failed: Cell::new(false),
            timestamp_offset: 0,
            last_local_ts: 0,
            last_timestamp: None,
            bytes_sent: 0,
            playback_start: 0,
            stream_offset: 0,
            next_check_buffer_underrun: 0,
            client_buffer: 0,
        }
    }

    // ----- accessors -----

    pub(crate) fn decision(&self) -> PlayDecision {
        self.decision
    }

    pub(crate) fn current_item(&self) -> Option<&PlayItem> {
        self.current_item.as_ref()
    }

    pub(crate) fn is_pull_mode(&self) -> bool {
        self.pull_mode
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn has_pull_job(&self) -> bool {
        self.pull_job.is_some()
    }

    pub(crate) fn dropper_state(&self) -> DropperState {
        self.dropper.state()
    }

    pub(crate) fn set_client_buffer(&mut self, buffer_ms: i64) {
        self.client_buffer = buffer_ms;
    }

    pub(crate) fn info(&self) -> StreamInfo {
        StreamInfo::new(self.stream_id, self.scope.app(), StreamKind::Subscriber)
            .with_connection(self.connection.id())
            .with_name(self.current_item.as_ref().map(|i| i.name.clone()))
    }

    pub(crate) fn statistics(&self) -> PlaybackStats {
        let estimated_buffer_fill = if self.client_buffer > 0 && self.last_timestamp.is_some() {
            let elapsed = self.now() - self.playback_start;
            let buffered = self.last_local_ts - elapsed;
            (buffered as f64 * 100.0) / self.client_buffer as f64
        } else {
            0.0
        };
        PlaybackStats {
            bytes_sent: self.bytes_sent,
            current_timestamp: self.last_timestamp.unwrap_or(0),
            estimated_buffer_fill,
        }
    }

    // ----- lifecycle -----

    pub(crate) fn start(&mut self) -> Result<()> {
        if self.state != StreamState::Uninit {
            return Err(Error::illegal_state("start", self.state.as_str()));
        }
        self.state = StreamState::Stopped;
        Ok(())
    }

    /// Attach the buckets of a bandwidth registration
    pub(crate) fn set_bandwidth(&mut self, context: BandwidthContext) {
        let service = &self.scope.services().bandwidth;
        self.audio_bucket = Some(service.audio_bucket(&context));
        self.video_bucket = Some(service.video_bucket(&context));
        self.bw_context = Some(context);
    }

    pub(crate) fn bandwidth_context(&self) -> Option<BandwidthContext> {
        self.bw_context
    }

    pub(crate) fn take_bandwidth(&mut self) -> Option<BandwidthContext> {
        self.audio_bucket = None;
        self.video_bucket = None;
        self.bw_context.take()
    }

    /// Play an item
    ///
    /// `with_reset` is false when a playlist moves on by itself; the client
    /// then gets a switch notification instead of a reset.
    pub(crate) fn play(&mut self, item: PlayItem, with_reset: bool) -> Result<()> {
        if self.state != StreamState::Stopped {
            return Err(Error::illegal_state("play", self.state.as_str()));
        }
        self.cancel_wait_job();
        self.waiting = false;
        self.unsubscribe_input();
        self.current_item = Some(item.clone());

        let (decision, input) = self.decide(&item);
        self.decision = decision;
        self.pull_mode = decision == PlayDecision::Vod;
        tracing::debug!(
            stream_id = self.stream_id,
            item = %item.name,
            start = item.start,
            length = item.length,
            decision = ?decision,
            "Play decision"
        );

        let mut send_notifications = true;
        match (decision, input) {
            (PlayDecision::Live, Some(Input::Live(scope))) => {
                send_notifications = self.play_live(&item, scope, with_reset);
            }
            (PlayDecision::Wait, _) => self.play_wait(&item),
            (PlayDecision::Vod, Some(Input::Vod(pipe))) => {
                if let Some(consumer) = self.consumer() {
                    if !pipe.subscribe_consumer(consumer) {
                        tracing::error!(stream_id = self.stream_id, item = %item.name, "Input source subscribe failed");
                    }
                }
                self.msg_in = Some(Input::Vod(pipe));
            }
            _ => {
                self.send_stream_not_found(&item);
                return Err(Error::StreamNotFound(item.name));
            }
        }

        self.state = StreamState::Playing;
        self.stream_offset = 0;

        let mut first = None;
        if self.pull_mode {
            if with_reset {
                self.release_pending();
            }
            match self.prepare_vod(&item) {
                Ok(message) => first = message,
                Err(e) => {
                    self.unsubscribe_input();
                    self.state = StreamState::Stopped;
                    return Err(e);
                }
            }
        }

        if send_notifications {
            if with_reset {
                self.send_reset();
                self.send_reset_status(&item);
            }
            self.send_start_status(&item);
            if !with_reset {
                self.send_play_status(StatusCode::PlaySwitch);
            }
        }
        if let Some(message) = first {
            self.emit(message);
        }

        let is_live = !self.pull_mode;
        self.scope.notify("playlist_item_play", &self.info(), |h, s| {
            h.playlist_item_play(s, &item, is_live)
        });

        let now = self.now();
        self.playback_start = now - self.stream_offset;
        self.next_check_buffer_underrun = now + self.scope.services().engine_config.buffer_check_interval_ms();
        if item.length != 0 {
            self.ensure_pull_running();
        }
        Ok(())
    }

    /// Stop the current item, moving on to the next one if there is one
    pub(crate) fn stop(&mut self) -> Result<()> {
        self.stop_current()?;
        if !self.playlist.has_more_items() {
            self.release_pending();
            self.reset_buckets();
            self.waiting_for_token.store(false, Ordering::Release);
            if !self.playlist.is_empty() {
                self.send_play_status(StatusCode::PlayComplete);
            }
            self.bytes_sent = 0;
            self.send_clear_ping();
            if let Some(item) = self.current_item.clone() {
                self.send_stop_status(&item);
            }
        } else {
            if let Some(ts) = self.last_timestamp {
                self.timestamp_offset = ts;
            }
            self.advance();
        }
        Ok(())
    }

    /// Stop the current item without touching the playlist
    pub(crate) fn stop_current(&mut self) -> Result<()> {
        if !matches!(self.state, StreamState::Playing | StreamState::Paused) {
            return Err(Error::illegal_state("stop", self.state.as_str()));
        }
        self.state = StreamState::Stopped;
        if !self.pull_mode {
            self.unsubscribe_input();
        }
        if let Some(item) = self.current_item.clone() {
            self.scope
                .notify("playlist_item_stop", &self.info(), |h, s| h.playlist_item_stop(s, &item));
        }
        self.clear_jobs();
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.unsubscribe_input();
        self.state = StreamState::Closed;
        self.clear_jobs();
        self.release_pending();
        self.last_timestamp = None;
        self.send_clear_ping();
    }

    pub(crate) fn pause(&mut self, position: i64) -> Result<()> {
        if self.state != StreamState::Playing {
            return Err(Error::illegal_state("pause", self.state.as_str()));
        }
        let Some(item) = self.current_item.clone() else {
            return Err(Error::illegal_state("pause", self.state.as_str()));
        };
        self.state = StreamState::Paused;
        self.release_pending();
        self.clear_jobs();
        self.send_clear_ping();
        self.send_status(
            Status::new(StatusCode::PauseNotify, self.stream_id).details(item.name.clone()),
        );
        self.scope
            .notify("vod_item_pause", &self.info(), |h, s| h.vod_item_pause(s, &item, position));
        Ok(())
    }

    pub(crate) fn resume(&mut self, position: i64) -> Result<()> {
        if self.state != StreamState::Paused {
            return Err(Error::illegal_state("resume", self.state.as_str()));
        }
        let Some(item) = self.current_item.clone() else {
            return Err(Error::illegal_state("resume", self.state.as_str()));
        };
        self.state = StreamState::Playing;
        self.send_reset();
        self.send_status(
            Status::new(StatusCode::UnpauseNotify, self.stream_id).details(item.name.clone()),
        );

        self.scope
            .notify("vod_item_resume", &self.info(), |h, s| h.vod_item_resume(s, &item, position));
        if self.pull_mode {
            self.send_vod_seek(position);
            self.playback_start = self.now() - position;
            if item.length >= 0 && position - self.stream_offset >= item.length {
                self.stop_logged();
            } else {
                self.ensure_pull_running();
            }
        } else {
            self.dropper.reset(DropperState::SendKeyframesCheck);
        }
        Ok(())
    }

    pub(crate) fn seek(&mut self, position: i64) -> Result<()> {
        if !matches!(
            self.state,
            StreamState::Playing | StreamState::Paused | StreamState::Stopped
        ) {
            return Err(Error::illegal_state("seek", self.state.as_str()));
        }
        if !self.pull_mode {
            return Err(Error::NotSupported("seek on a live stream"));
        }
        let Some(item) = self.current_item.clone() else {
            return Err(Error::illegal_state("seek", self.state.as_str()));
        };

        self.release_pending();
        self.clear_jobs();
        self.reset_buckets();
        self.waiting_for_token.store(false, Ordering::Release);
        self.send_clear_ping();
        self.send_reset();
        self.send_status(
            Status::new(StatusCode::SeekNotify, self.stream_id)
                .details(item.name.clone())
                .description(format!(
                    "Seeking {} (stream ID: {}).",
                    position, self.stream_id
                )),
        );
        self.send_start_status(&item);

        let seek_pos = self.send_vod_seek(position).unwrap_or(position);
        self.playback_start = self.now() - seek_pos;
        self.scope
            .notify("vod_item_seek", &self.info(), |h, s| h.vod_item_seek(s, &item, seek_pos));

        let mut message_sent = false;
        match self.state {
            StreamState::Paused | StreamState::Stopped => {
                if self.source_has_video() {
                    if let Some(mut keyframe) = self.pull_keyframe() {
                        keyframe.timestamp = seek_pos;
                        self.emit(keyframe);
                        message_sent = true;
                    }
                }
            }
            _ => self.ensure_pull_running(),
        }
        if !message_sent {
            // Realigns the client timeline when no frame was sent
            self.emit(RtmpEvent::blank_audio(seek_pos));
        }

        if self.state == StreamState::Playing
            && item.length >= 0
            && seek_pos - self.stream_offset >= item.length
        {
            self.stop_logged();
        }
        Ok(())
    }

    pub(crate) fn receive_video(&mut self, receive: bool) {
        let enabled = receive && !self.receive_video;
        self.receive_video = receive;
        if enabled {
            self.seek_to_current_playback();
        }
    }

    pub(crate) fn receive_audio(&mut self, receive: bool) {
        if self.receive_audio && !receive {
            self.send_blank_audio = true;
        }
        let enabled = receive && !self.receive_audio;
        self.receive_audio = receive;
        if enabled {
            self.seek_to_current_playback();
        }
    }

    fn seek_to_current_playback(&mut self) {
        if self.pull_mode {
            let position = self.now() - self.playback_start;
            if let Err(e) = self.seek(position) {
                tracing::debug!(stream_id = self.stream_id, error = %e, "Re-seek after track change failed");
            }
        }
    }

    // ----- playlist movement -----

    /// Play the next playable item after the cursor
    pub(crate) fn advance(&mut self) {
        let mut remaining = self.playlist.len();
        let mut index = self.playlist.move_next();
        while let Some(i) = index {
            if remaining == 0 {
                break;
            }
            remaining -= 1;
            let Some(item) = self.playlist.item(i).cloned() else {
                break;
            };
            match self.play(item, false) {
                Ok(()) => break,
                Err(e @ (Error::StreamNotFound(_) | Error::Io(_))) => {
                    tracing::warn!(stream_id = self.stream_id, error = %e, "Skipping playlist item");
                    index = self.playlist.move_next();
                }
                Err(e) => {
                    tracing::error!(stream_id = self.stream_id, error = %e, "Failed to play next playlist item");
                    break;
                }
            }
        }
    }

    fn stop_logged(&mut self) {
        if let Err(e) = self.stop() {
            tracing::debug!(stream_id = self.stream_id, error = %e, "Stop skipped");
        }
    }

    // ----- source resolution -----

    fn decide(&self, item: &PlayItem) -> (PlayDecision, Option<Input>) {
        let providers = &self.scope.services().providers;
        let app = self.scope.app();
        let live = || providers.live_provider_input(app, &item.name, false).map(Input::Live);
        let vod = || providers.vod_provider_input(app, &item.name).map(Input::Vod);

        match item.play_type() {
            -1 => match live() {
                Some(input) => (PlayDecision::Live, Some(input)),
                None => (PlayDecision::Wait, None),
            },
            t if t < -1 => match live() {
                Some(input) => (PlayDecision::Live, Some(input)),
                None => match vod() {
                    Some(input) => (PlayDecision::Vod, Some(input)),
                    None => (PlayDecision::Wait, None),
                },
            },
            _ => match vod() {
                Some(input) => (PlayDecision::Vod, Some(input)),
                None => (PlayDecision::NotFound, None),
            },
        }
    }

    /// Subscribe to a live scope; returns whether the caller should still
    /// send start notifications
    fn play_live(&mut self, item: &PlayItem, scope: Arc<BroadcastScope>, with_reset: bool) -> bool {
        self.dropper.reset(DropperState::SendKeyframesCheck);
        let mut send_notifications = true;

        if let Some(info) = scope.codec_info().filter(|info| info.has_video_codec()) {
            if with_reset {
                self.send_reset();
                self.send_reset_status(item);
                self.send_start_status(item);
            }
            send_notifications = false;

            let (config, keyframe) = info.start_frames();
            if let Some(config) = config {
                self.push_out(RtmpEvent::video(0, config).into());
            }
            if let Some(keyframe) = keyframe {
                self.push_out(RtmpEvent::video(0, keyframe).into());
                self.dropper.reset(DropperState::SendAll);
            }
        }

        self.subscribe_live(scope);
        send_notifications
    }

    fn play_wait(&mut self, item: &PlayItem) {
        self.connect_to_provider(&item.name);
        self.waiting = true;

        let config = &self.scope.services().engine_config;
        if item.play_type() == -1 {
            if item.length >= 0 {
                self.schedule_wait(delay_ms(item.length), WaitJob::ItemEnd);
            }
        } else {
            let timeout = config.live_wait_timeout;
            self.schedule_wait(timeout, WaitJob::Timeout);
        }
    }

    fn connect_to_provider(&mut self, name: &str) {
        let scope = self
            .scope
            .services()
            .providers
            .live_provider_input(self.scope.app(), name, true);
        match scope {
            Some(scope) => self.subscribe_live(scope),
            None => tracing::warn!(stream_id = self.stream_id, name = name, "No live input to wait on"),
        }
    }

    fn subscribe_live(&mut self, scope: Arc<BroadcastScope>) {
        if let Some(consumer) = self.consumer() {
            if !scope.subscribe_consumer(consumer) {
                tracing::warn!(stream_id = self.stream_id, stream = %scope.key(), "Live input refused subscription");
            }
        }
        self.msg_in = Some(Input::Live(scope));
    }

    /// Initialise the VOD source and fetch the first message
    fn prepare_vod(&mut self, item: &PlayItem) -> Result<Option<RtmpEvent>> {
        self.send_oob_to_input(
            OobTarget::Passive,
            OobService::Init {
                start_ts: item.start.max(0),
            },
        );
        if item.start > 0 {
            self.stream_offset = self.send_vod_seek(item.start).unwrap_or(item.start);
        }

        let Some(Input::Vod(pipe)) = self.msg_in.clone() else {
            return Ok(None);
        };
        let mut message = pipe.pull_message()?;
        if item.length == 0 {
            // Only the first video frame
            while let Some(m) = &message {
                if m.is_video() {
                    break;
                }
                message = pipe.pull_message()?;
            }
        }
        Ok(message)
    }

    fn unsubscribe_input(&mut self) {
        match self.msg_in.take() {
            Some(Input::Live(scope)) => {
                scope.unsubscribe_consumer(self.endpoint);
            }
            Some(Input::Vod(pipe)) => {
                pipe.unsubscribe_consumer(self.endpoint);
            }
            None => {}
        }
    }

    fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.owner.upgrade().map(|s| s as Arc<dyn Consumer>)
    }

    // ----- pipe events -----

    /// A publisher connected to the live input
    pub(crate) fn on_provider_connect(&mut self) {
        if self.waiting {
            self.cancel_wait_job();
            self.waiting = false;
            self.decision = PlayDecision::Live;
        }
        if let Some(item) = self.current_item.clone() {
            self.send_status(
                Status::new(StatusCode::PlayPublishNotify, self.stream_id).details(item.name),
            );
        }
    }

    /// The publisher of the input went away
    pub(crate) fn on_provider_disconnect(&mut self) {
        let Some(item) = self.current_item.clone() else {
            return;
        };
        if self.pull_mode {
            self.send_stop_status(&item);
        } else {
            self.send_status(
                Status::new(StatusCode::PlayUnpublishNotify, self.stream_id).details(item.name),
            );
        }
    }

    /// Message pushed by a live publisher
    pub(crate) fn push_live(&mut self, message: &PipeMessage) -> Result<()> {
        if self.pull_mode || !matches!(self.state, StreamState::Playing | StreamState::Paused) {
            return Ok(());
        }
        match message {
            PipeMessage::Reset => {
                self.send_reset();
                Ok(())
            }
            PipeMessage::Status(status) => {
                self.push_out(PipeMessage::Status(status.clone()));
                Ok(())
            }
            PipeMessage::Rtmp(event) => {
                self.push_live_event(event.clone());
                Ok(())
            }
        }
    }

    fn push_live_event(&mut self, mut event: RtmpEvent) {
        let size = event.size() as u64;
        let paused = self.state == StreamState::Paused;

        if event.is_video() {
            if self.live_can_drop_frames() {
                if paused {
                    self.dropper.drop_packet(&event);
                    return;
                }
                let pending_videos = self.pending_video_count();
                if !self.dropper.can_send_packet(&event, pending_videos) {
                    tracing::trace!(stream_id = self.stream_id, "Frame dropper refused video");
                    return;
                }
                let granted = self.receive_video
                    && self
                        .video_bucket
                        .as_ref()
                        .map(|b| b.acquire_token(size, Some(Duration::ZERO)))
                        .unwrap_or(true);
                if !granted {
                    self.dropper.drop_packet(&event);
                    return;
                }
                if pending_videos > 1 {
                    self.check_insufficient_bandwidth();
                    self.dropper.drop_packet(&event);
                    return;
                }
                self.dropper.send_packet(&event);
            } else if paused || !self.receive_video {
                return;
            }
        } else if event.is_audio() {
            if !self.receive_audio && self.send_blank_audio {
                self.send_blank_audio = false;
                event = RtmpEvent::blank_audio(self.last_timestamp.unwrap_or(0));
            } else if paused
                || !self.receive_audio
                || !self
                    .audio_bucket
                    .as_ref()
                    .map(|b| b.acquire_token(size, Some(Duration::ZERO)))
                    .unwrap_or(true)
            {
                return;
            }
        }

        self.bytes_sent += event.size() as u64;
        self.last_timestamp = Some(event.timestamp);
        self.push_out(event.into());
    }

    fn live_can_drop_frames(&self) -> bool {
        match &self.msg_in {
            Some(Input::Live(scope)) => scope
                .codec_info()
                .map(|info| info.can_drop_frames())
                .unwrap_or(true),
            _ => true,
        }
    }

    // ----- VOD pacing -----

    /// Deliver every VOD message that is due, then re-arm the loop
    pub(crate) fn pull_and_push(&mut self) {
        loop {
            if self.state != StreamState::Playing
                || !self.pull_mode
                || self.waiting_for_token.load(Ordering::Acquire)
            {
                return;
            }

            let message = match self.pending.take() {
                Some(message) => message,
                None => match self.next_vod_message() {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tracing::debug!(stream_id = self.stream_id, "End of VOD input");
                        self.stop_logged();
                        return;
                    }
                    Err(e) => {
                        tracing::error!(stream_id = self.stream_id, error = %e, "Failed to pull message, stopping");
                        self.stop_logged();
                        return;
                    }
                },
            };

            let delta = message.timestamp - (self.now() - self.playback_start);
            if delta > WAIT_THRESHOLD_MS {
                self.pending = Some(message);
                self.schedule_pull(delta);
                return;
            }

            if !self.okay_to_send(&message) {
                self.pending = Some(message);
                if !self.waiting_for_token.load(Ordering::Acquire) {
                    let retry = self.scope.services().engine_config.retry_interval;
                    self.schedule_pull_after(retry);
                }
                return;
            }
            self.send_message(message);
            if self.output_failed.replace(false) {
                tracing::warn!(stream_id = self.stream_id, "Client write failed, stopping playback");
                self.stop_logged();
                return;
            }
        }
    }

    /// Tokens requested earlier were granted
    pub(crate) fn on_tokens_available(&mut self) {
        self.waiting_for_token.store(false, Ordering::Release);
        // Kept until a message on the same channel goes out, even when the
        // pending message is deferred again
        if let Some(grant) = self.requested.take() {
            self.prepaid = Some(grant);
        }
        self.pull_and_push();
    }

    /// The connection flushed a message; keep the loop going
    pub(crate) fn on_written(&mut self) {
        if self.state == StreamState::Playing {
            self.ensure_pull_running();
        }
    }

    fn next_vod_message(&mut self) -> Result<Option<RtmpEvent>> {
        let Some(Input::Vod(pipe)) = self.msg_in.clone() else {
            return Ok(None);
        };
        loop {
            let Some(message) = pipe.pull_message()? else {
                return Ok(None);
            };
            if message.is_audio() && !self.receive_audio {
                if self.send_blank_audio {
                    self.send_blank_audio = false;
                    return Ok(Some(RtmpEvent::blank_audio(self.last_local_ts)));
                }
                continue;
            }
            if message.is_video() && !self.receive_video {
                continue;
            }
            return Ok(Some(message));
        }
    }

    fn okay_to_send(&mut self, message: &RtmpEvent) -> bool {
        let now = self.now();
        if self.client_buffer > 0 && self.last_timestamp.is_some() {
            let buffered = self.last_local_ts - (now - self.playback_start);
            if buffered > self.client_buffer * CLIENT_BUFFER_HEADROOM {
                tracing::trace!(stream_id = self.stream_id, buffered = buffered, "Client buffer full");
                return false;
            }
        }

        let pending = self.pending_count();
        if pending > self.scope.services().engine_config.underrun_trigger {
            self.check_insufficient_bandwidth();
            tracing::trace!(stream_id = self.stream_id, pending = pending, "Connection backlog, deferring");
            return false;
        }

        let size = message.size() as u64;
        if size == 0 || !(message.is_audio() || message.is_video()) {
            return true;
        }
        let video = message.is_video();
        if let Some((prepaid_video, tokens)) = self.prepaid {
            if prepaid_video == video && tokens >= size {
                self.prepaid = None;
                return true;
            }
        }
        let bucket = if video {
            self.video_bucket.clone()
        } else {
            self.audio_bucket.clone()
        };
        let (Some(bucket), Some(owner)) = (bucket, self.owner.upgrade()) else {
            return true;
        };
        let callback: Arc<dyn TokenBucketCallback> = owner;
        if !bucket.acquire_token_nonblocking(size, callback) {
            tracing::debug!(stream_id = self.stream_id, tokens = size, "Waiting for tokens");
            self.requested = Some((video, size));
            self.waiting_for_token.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn send_message(&mut self, message: RtmpEvent) {
        if let Some(item) = &self.current_item {
            if item.length >= 0 && message.timestamp - self.stream_offset >= item.length {
                self.stop_logged();
                return;
            }
        }
        self.emit(message);
    }

    /// Write a VOD message, shifted onto the playlist timeline
    fn emit(&mut self, mut message: RtmpEvent) {
        self.last_local_ts = message.timestamp;
        message.timestamp += self.timestamp_offset;
        self.last_timestamp = Some(message.timestamp);
        self.bytes_sent += message.size() as u64;
        self.push_out(message.into());
    }

    fn pull_keyframe(&mut self) -> Option<RtmpEvent> {
        let Some(Input::Vod(pipe)) = self.msg_in.clone() else {
            return None;
        };
        loop {
            match pipe.pull_message() {
                Ok(Some(message)) if message.is_keyframe() => return Some(message),
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(stream_id = self.stream_id, error = %e, "Failed to pull keyframe");
                    return None;
                }
            }
        }
    }

    fn check_insufficient_bandwidth(&mut self) {
        let interval = self.scope.services().engine_config.buffer_check_interval_ms();
        let now = self.now();
        if interval > 0 && now >= self.next_check_buffer_underrun {
            if let Some(item) = self.current_item.clone() {
                self.send_status(
                    Status::new(StatusCode::PlayInsufficientBw, self.stream_id)
                        .details(item.name)
                        .description("Data is playing behind the normal speed."),
                );
            }
            self.next_check_buffer_underrun = now + interval;
        }
    }

    fn release_pending(&mut self) {
        self.pending = None;
    }

    fn reset_buckets(&self) {
        if let Some(context) = &self.bw_context {
            self.scope.services().bandwidth.reset_buckets(context);
        }
    }

    // ----- jobs -----

    fn ensure_pull_running(&mut self) {
        if self.pull_mode && self.pull_job.is_none() {
            self.schedule_pull(0);
        }
    }

    fn schedule_pull(&mut self, delay: i64) {
        self.schedule_pull_after(delay_ms(delay));
    }

    fn schedule_pull_after(&mut self, delay: Duration) {
        self.cancel_pull_job();
        let generation = self.pull_generation;
        let owner = self.owner.clone();
        let id = self.scope.services().scheduler.add_scheduled_once_job(
            delay,
            Box::new(move || {
                if let Some(stream) = owner.upgrade() {
                    stream.with_engine(|engine| engine.run_pull_job(generation));
                }
            }),
        );
        self.pull_job = Some(id);
    }

    fn run_pull_job(&mut self, generation: u64) {
        if generation != self.pull_generation {
            return;
        }
        self.pull_job = None;
        self.pull_and_push();
    }

    fn cancel_pull_job(&mut self) {
        if let Some(id) = self.pull_job.take() {
            self.scope.services().scheduler.remove_scheduled_job(id);
        }
        self.pull_generation += 1;
    }

    fn schedule_wait(&mut self, delay: Duration, job: WaitJob) {
        self.cancel_wait_job();
        let generation = self.wait_generation;
        let owner = self.owner.clone();
        let id = self.scope.services().scheduler.add_scheduled_once_job(
            delay,
            Box::new(move || {
                if let Some(stream) = owner.upgrade() {
                    stream.with_engine(|engine| engine.run_wait_job(generation, job));
                }
            }),
        );
        self.wait_job = Some(id);
    }

    fn run_wait_job(&mut self, generation: u64, job: WaitJob) {
        if generation != self.wait_generation || self.wait_job.is_none() {
            return;
        }
        self.wait_job = None;
        self.waiting = false;
        if self.msg_in.is_none() {
            if let Some(name) = self.current_item.as_ref().map(|i| i.name.clone()) {
                self.connect_to_provider(&name);
            }
        }
        match job {
            WaitJob::Timeout => {
                tracing::debug!(stream_id = self.stream_id, "Live wait timed out");
            }
            WaitJob::ItemEnd => self.stop_logged(),
        }
    }

    fn cancel_wait_job(&mut self) {
        if let Some(id) = self.wait_job.take() {
            self.scope.services().scheduler.remove_scheduled_job(id);
        }
        self.wait_generation += 1;
    }

    fn clear_jobs(&mut self) {
        self.cancel_pull_job();
        self.cancel_wait_job();
        self.waiting = false;
    }

    // ----- OOB -----

    fn send_oob_to_input(&self, target: OobTarget, service: OobService) -> OobControlMessage {
        let mut msg = OobControlMessage::new(target, service);
        if let Some(Input::Vod(pipe)) = &self.msg_in {
            pipe.send_oob_to_providers(&mut msg);
        }
        msg
    }

    fn send_vod_seek(&self, position: i64) -> Option<i64> {
        self.send_oob_to_input(OobTarget::SeekableProvider, OobService::Seek { position })
            .position()
            .filter(|p| *p >= 0)
    }

    fn source_has_video(&self) -> bool {
        self.send_oob_to_input(OobTarget::StreamTypeAwareProvider, OobService::HasVideo)
            .flag()
            .unwrap_or(false)
    }

    fn pending_count(&self) -> u64 {
        let mut msg = OobControlMessage::new(OobTarget::ConnectionConsumer, OobService::PendingCount);
        self.msg_out.send_oob_to_consumers(&mut msg);
        msg.count().unwrap_or(0)
    }

    fn pending_video_count(&self) -> u64 {
        let mut msg =
            OobControlMessage::new(OobTarget::ConnectionConsumer, OobService::PendingVideoCount);
        self.msg_out.send_oob_to_consumers(&mut msg);
        msg.count().unwrap_or(0)
    }

    // ----- output -----

    fn now(&self) -> i64 {
        self.scope.services().clock.now_ms()
    }

    fn push_out(&self, message: PipeMessage) {
        if let Err(e) = self.msg_out.push_message(&message) {
            tracing::error!(stream_id = self.stream_id, error = %e, "Failed to push message to client");
            if e.is_io() {
                self.output_failed.set(true);
            }
        }
    }

    fn send_status(&self, status: Status) {
        self.push_out(PipeMessage::Status(status));
    }

    fn send_ping(&self, kind: PingKind) {
        self.push_out(RtmpEvent::ping(kind, self.stream_id).into());
    }

    fn send_clear_ping(&self) {
        self.send_ping(PingKind::StreamPlayBufferClear);
    }

    /// Tell the client and downstream consumers to restart their timeline
    fn send_reset(&self) {
        if self.pull_mode {
            self.send_ping(PingKind::RecordedStream);
        }
        self.send_ping(PingKind::StreamBegin);
        self.push_out(PipeMessage::Reset);
    }

    fn send_reset_status(&self, item: &PlayItem) {
        self.send_status(
            Status::new(StatusCode::PlayReset, self.stream_id)
                .details(item.name.clone())
                .description(format!("Playing and resetting {}.", item.name)),
        );
    }

    fn send_start_status(&self, item: &PlayItem) {
        self.send_status(
            Status::new(StatusCode::PlayStart, self.stream_id)
                .details(item.name.clone())
                .description(format!("Started playing {}.", item.name)),
        );
    }

    fn send_stop_status(&self, item: &PlayItem) {
        self.send_status(
            Status::new(StatusCode::PlayStop, self.stream_id)
                .details(item.name.clone())
                .description(format!("Stopped playing {}.", item.name)),
        );
    }

    fn send_stream_not_found(&self, item: &PlayItem) {
        self.send_status(
            Status::new(StatusCode::PlayStreamNotFound, self.stream_id).details(item.name.clone()),
        );
    }

    /// `onPlayStatus` for playlist switches and completion
    fn send_play_status(&self, code: StatusCode) {
        let body = EventBody::PlayStatus(PlayStatus {
            code: code.as_str(),
            duration: 1,
            bytes: self.bytes_sent,
        });
        self.push_out(RtmpEvent::new(body, self.last_timestamp.unwrap_or(0)).into());
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::media::FlvTag;
    use crate::stream::config::EngineConfig;
    use crate::testing::{Fixture, RecordingConnection};

    fn clip(duration_ms: u32, step: u32) -> Vec<FlvTag> {
        let mut tags = Vec::new();
        let mut ts = 0;
        while ts < duration_ms {
            let header = if ts % 1000 == 0 { 0x12 } else { 0x22 };
            tags.push(FlvTag::video(ts, Bytes::from(vec![header, 0x00, 0x01])));
            tags.push(FlvTag::audio(ts, Bytes::from_static(&[0x2F, 0x01])));
            ts += step;
        }
        tags
    }

    fn video_timestamps(connection: &RecordingConnection, stream_id: u32) -> Vec<i64> {
        connection
            .events(stream_id)
            .into_iter()
            .filter(|e| e.is_video())
            .map(|e| e.timestamp)
            .collect()
    }

    fn play(stream: &PlaylistSubscriberStream, item: PlayItem) {
        stream.add_item(item);
        stream.play().unwrap();
    }

    #[test]
    fn test_vod_play_paces_to_timestamps() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(1000, 100));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0));
        assert_eq!(stream.decision(), PlayDecision::Vod);
        assert!(stream.with_engine(|e| e.is_pull_mode()));
        assert_eq!(
            fixture.connection.statuses(1),
            vec![StatusCode::PlayReset, StatusCode::PlayStart]
        );
        // The first frame goes out with the start notifications
        assert_eq!(video_timestamps(&fixture.connection, 1), vec![0]);

        fixture.scheduler.advance(0);
        assert_eq!(video_timestamps(&fixture.connection, 1), vec![0]);

        fixture.scheduler.advance(100);
        assert_eq!(video_timestamps(&fixture.connection, 1), vec![0, 100]);

        fixture.scheduler.advance(250);
        assert_eq!(
            video_timestamps(&fixture.connection, 1),
            vec![0, 100, 200, 300]
        );
        assert!(stream.with_engine(|e| e.has_pending()));
    }

    #[test]
    fn test_vod_completes_at_end_of_file() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(10_000, 500));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0));
        fixture.scheduler.advance(11_000);

        let completes = fixture
            .connection
            .events(1)
            .iter()
            .filter(|e| {
                matches!(&e.body, EventBody::PlayStatus(s) if s.code == "NetStream.Play.Complete")
            })
            .count();
        assert_eq!(completes, 1);
        assert_eq!(
            fixture.connection.statuses(1).last(),
            Some(&StatusCode::PlayStop)
        );
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(fixture.scheduler.pending_jobs(), 0);
    }

    #[test]
    fn test_vod_length_ends_item() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(10_000, 500));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0).length(2000));
        fixture.scheduler.advance(5000);

        assert_eq!(
            video_timestamps(&fixture.connection, 1).last(),
            Some(&1500)
        );
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn test_vod_start_offset_seeks_source() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(10_000, 500));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(3000).length(1000));
        assert_eq!(video_timestamps(&fixture.connection, 1), vec![3000]);

        // Playback clock starts at the seek point
        fixture.scheduler.advance(500);
        assert_eq!(
            video_timestamps(&fixture.connection, 1),
            vec![3000, 3500]
        );
        fixture.scheduler.advance(500);
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn test_backlog_defers_single_message() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(2000, 100));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0));
        fixture.connection.set_pending(50, 0);
        fixture.scheduler.advance(500);

        // Backlog above the underrun trigger holds everything after the first
        assert_eq!(video_timestamps(&fixture.connection, 1), vec![0]);
        stream.with_engine(|e| {
            assert!(e.has_pending());
            assert!(e.has_pull_job());
        });

        fixture.connection.set_pending(0, 0);
        fixture.scheduler.advance(20);
        assert_eq!(
            video_timestamps(&fixture.connection, 1),
            vec![0, 100, 200, 300, 400, 500]
        );
    }

    #[test]
    fn test_backlog_reports_insufficient_bandwidth() {
        let fixture = Fixture::with_config(
            EngineConfig::default().buffer_check_interval(Duration::from_millis(1000)),
        );
        fixture.files.insert("streams/clip.flv", clip(5000, 100));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0));
        fixture.connection.set_pending(50, 0);
        fixture.scheduler.advance(2500);

        let reports = fixture
            .connection
            .statuses(1)
            .into_iter()
            .filter(|s| *s == StatusCode::PlayInsufficientBw)
            .count();
        assert_eq!(reports, 2);
    }

    #[test]
    fn test_missing_vod_reports_not_found() {
        let fixture = Fixture::new();
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("nothing").start(0));
        assert_eq!(
            fixture.connection.statuses(1),
            vec![StatusCode::PlayStreamNotFound]
        );
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(stream.decision(), PlayDecision::NotFound);
    }

    #[test]
    fn test_live_play_sends_cached_config_first() {
        let fixture = Fixture::new();
        let publisher = fixture.publisher(7, "cam1");
        publisher.dispatch_event(RtmpEvent::video(0, Bytes::from_static(&[0x17, 0x00, 0xAA])));
        publisher.dispatch_event(RtmpEvent::video(40, Bytes::from_static(&[0x17, 0x01, 0xBB])));

        let stream = fixture.subscriber(1);
        play(&stream, PlayItem::new("cam1").start(-1000));
        assert_eq!(stream.decision(), PlayDecision::Live);
        assert_eq!(
            stream.with_engine(|e| e.dropper_state()),
            DropperState::SendAll
        );

        let video: Vec<_> = fixture
            .connection
            .events(1)
            .into_iter()
            .filter(|e| e.is_video())
            .collect();
        assert_eq!(video.len(), 2);
        assert_eq!(video[0].data().unwrap()[1], 0x00);
        assert_eq!(video[0].timestamp, 0);
        assert_eq!(video[1].data().unwrap()[1], 0x01);

        publisher.dispatch_event(RtmpEvent::audio(60, Bytes::from_static(&[0xAF, 0x01])));
        let last = fixture.connection.events(1).pop().unwrap();
        assert!(last.is_audio());
        assert_eq!(last.timestamp, 60);
    }

    #[test]
    fn test_live_backlog_drops_video() {
        let fixture = Fixture::new();
        let publisher = fixture.publisher(7, "cam1");
        let stream = fixture.subscriber(1);
        play(&stream, PlayItem::new("cam1").start(-1000));

        fixture.connection.set_pending(0, 3);
        publisher.dispatch_event(RtmpEvent::video(0, Bytes::from_static(&[0x22, 0x00])));
        publisher.dispatch_event(RtmpEvent::audio(0, Bytes::from_static(&[0x2F, 0x00])));
        assert!(fixture.connection.events(1).iter().all(|e| !e.is_video()));
        assert!(fixture.connection.events(1).iter().any(|e| e.is_audio()));

        // Keyframes only until the connection drains
        fixture.connection.set_pending(0, 0);
        publisher.dispatch_event(RtmpEvent::video(40, Bytes::from_static(&[0x22, 0x00])));
        assert!(fixture.connection.events(1).iter().all(|e| !e.is_video()));
        publisher.dispatch_event(RtmpEvent::video(80, Bytes::from_static(&[0x12, 0x00])));
        assert_eq!(video_timestamps(&fixture.connection, 1), vec![80]);
    }

    #[test]
    fn test_live_pause_drops_media() {
        let fixture = Fixture::new();
        let publisher = fixture.publisher(7, "cam1");
        let stream = fixture.subscriber(1);
        play(&stream, PlayItem::new("cam1").start(-1000));
        stream.pause(0).unwrap();
        fixture.connection.clear();

        publisher.dispatch_event(RtmpEvent::audio(0, Bytes::from_static(&[0x2F, 0x00])));
        publisher.dispatch_event(RtmpEvent::video(0, Bytes::from_static(&[0x12, 0x00])));
        assert!(fixture.connection.events(1).is_empty());

        stream.resume(0).unwrap();
        assert_eq!(
            fixture.connection.statuses(1),
            vec![StatusCode::UnpauseNotify]
        );
        assert_eq!(
            stream.with_engine(|e| e.dropper_state()),
            DropperState::SendKeyframesCheck
        );
    }

    #[test]
    fn test_live_wait_until_published() {
        let fixture = Fixture::new();
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("later"));
        assert_eq!(stream.decision(), PlayDecision::Wait);
        assert!(stream.with_engine(|e| e.is_waiting()));
        assert_eq!(fixture.scheduler.pending_jobs(), 1);

        let _publisher = fixture.publisher(7, "later");
        assert!(!stream.with_engine(|e| e.is_waiting()));
        assert_eq!(stream.decision(), PlayDecision::Live);
        assert!(fixture
            .connection
            .statuses(1)
            .contains(&StatusCode::PlayPublishNotify));
        assert_eq!(fixture.scheduler.pending_jobs(), 0);
    }

    #[test]
    fn test_live_wait_times_out() {
        let fixture = Fixture::new();
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("later"));
        fixture.scheduler.advance(15_000);
        assert!(!stream.with_engine(|e| e.is_waiting()));
        // Still subscribed, still playing
        assert_eq!(stream.state(), StreamState::Playing);
    }

    #[test]
    fn test_live_item_length_moves_on() {
        let fixture = Fixture::new();
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("absent").start(-1000).length(3000));
        fixture.scheduler.advance(2999);
        assert_eq!(stream.state(), StreamState::Playing);
        fixture.scheduler.advance(1);

        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(
            fixture.connection.statuses(1).last(),
            Some(&StatusCode::PlayStop)
        );
    }

    #[test]
    fn test_publisher_leaving_notifies_subscriber() {
        let fixture = Fixture::new();
        let publisher = fixture.publisher(7, "cam1");
        let stream = fixture.subscriber(1);
        play(&stream, PlayItem::new("cam1").start(-1000));

        publisher.close();
        assert_eq!(
            fixture.connection.statuses(1).last(),
            Some(&StatusCode::PlayUnpublishNotify)
        );
    }

    #[test]
    fn test_seek_while_paused_sends_one_keyframe() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(10_000, 100));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0));
        fixture.scheduler.advance(300);
        stream.pause(300).unwrap();
        fixture.connection.clear();

        stream.seek(5000).unwrap();

        let video: Vec<_> = fixture
            .connection
            .events(1)
            .into_iter()
            .filter(|e| e.is_video())
            .collect();
        assert_eq!(video.len(), 1);
        assert!(video[0].is_keyframe());
        assert_eq!(video[0].timestamp, 5000);
        assert_eq!(
            fixture.connection.statuses(1),
            vec![StatusCode::SeekNotify, StatusCode::PlayStart]
        );
        assert_eq!(fixture.scheduler.pending_jobs(), 0);
        assert_eq!(stream.state(), StreamState::Paused);

        stream.resume(5000).unwrap();
        assert_eq!(fixture.scheduler.pending_jobs(), 1);
        fixture.scheduler.advance(100);
        assert_eq!(
            video_timestamps(&fixture.connection, 1),
            vec![5000, 5000, 5100]
        );
    }

    #[test]
    fn test_seek_while_playing_restarts_loop() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(10_000, 100));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0));
        fixture.scheduler.advance(200);
        fixture.connection.clear();

        stream.seek(2000).unwrap();
        // Blank audio realigns the client while the loop restarts
        let events = fixture.connection.events(1);
        let blank = events.iter().find(|e| e.is_audio()).unwrap();
        assert_eq!(blank.size(), 0);
        assert_eq!(blank.timestamp, 2000);

        fixture.scheduler.advance(0);
        assert_eq!(video_timestamps(&fixture.connection, 1), vec![2000]);
    }

    #[test]
    fn test_seek_on_live_not_supported() {
        let fixture = Fixture::new();
        let _publisher = fixture.publisher(7, "cam1");
        let stream = fixture.subscriber(1);
        play(&stream, PlayItem::new("cam1"));

        assert!(matches!(stream.seek(1000), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_illegal_transitions() {
        let fixture = Fixture::new();
        let stream = fixture.subscriber(1);
        assert!(matches!(stream.pause(0), Err(Error::IllegalState { .. })));
        assert!(matches!(stream.resume(0), Err(Error::IllegalState { .. })));
        assert!(matches!(stream.stop(), Err(Error::IllegalState { .. })));
    }

    #[test]
    fn test_pause_after_playback_completed() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(1000, 100));
        let stream = fixture.subscriber(1);

        play(&stream, PlayItem::new("clip").start(0));
        fixture.scheduler.advance(2000);
        assert_eq!(stream.state(), StreamState::Stopped);

        assert!(matches!(stream.pause(0), Err(Error::IllegalState { .. })));
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(!fixture
            .connection
            .statuses(1)
            .contains(&StatusCode::PauseNotify));
    }

    #[test]
    fn test_pending_slot_holds_at_most_one() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/clip.flv", clip(3000, 20));
        let stream = fixture.subscriber(1);
        play(&stream, PlayItem::new("clip").start(0));

        for step in 0..200 {
            let backlog = if step % 3 == 0 { 20 } else { 0 };
            fixture.connection.set_pending(backlog, 0);
            fixture.scheduler.advance(7);
            stream.with_engine(|e| {
                // A parked message always has a job to replay it
                if e.has_pending() && e.state == StreamState::Playing {
                    assert!(e.has_pull_job());
                }
            });
        }

        fixture.connection.set_pending(0, 0);
        fixture.scheduler.advance(3000);
        let sent = video_timestamps(&fixture.connection, 1);
        assert!(sent.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sent.len(), 150);
        assert_eq!(stream.state(), StreamState::Stopped);
    }
}
