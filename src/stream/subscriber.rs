//! Playlist subscriber stream
//!
//! The client-facing play stream: a [`Playlist`] and a [`PlayEngine`] behind
//! one lock. The stream is itself the engine's pipe consumer, its token
//! bucket callback and its bandwidth controllable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::bandwidth::{
    BandwidthConfigure, BandwidthControllable, ControllableId, TokenBucket, TokenBucketCallback,
};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{Error, Result};
use crate::messaging::{
    Consumer, EndpointId, MessageComponent, OobControlMessage, OobTarget, Pipe,
    PipeConnectionEvent, PipeMessage,
};
use crate::stats::PlaybackStats;

use super::context::StreamScope;
use super::engine::{PlayDecision, PlayEngine};
use super::playlist::PlaylistController;
use super::state::{PlayItem, StreamState};

pub struct PlaylistSubscriberStream {
    stream_id: u32,
    endpoint: EndpointId,
    controllable: ControllableId,
    scope: Arc<StreamScope>,
    connection: ConnectionHandle,
    msg_out: Arc<Pipe>,
    core: Mutex<PlayEngine>,
    bw_configure: RwLock<Option<BandwidthConfigure>>,
    waiting_for_token: Arc<AtomicBool>,
    client_buffer: RwLock<i64>,
    created_at: Instant,
}

impl PlaylistSubscriberStream {
    pub fn new(stream_id: u32, scope: Arc<StreamScope>, connection: ConnectionHandle) -> Arc<Self> {
        let msg_out = scope
            .services()
            .consumers
            .consumer_output(&connection, stream_id);
        let endpoint = EndpointId::next();
        let waiting_for_token = Arc::new(AtomicBool::new(false));

        Arc::new_cyclic(|owner| {
            let engine = PlayEngine::new(
                stream_id,
                Arc::clone(&scope),
                owner.clone(),
                endpoint,
                connection.clone(),
                Arc::clone(&msg_out),
                Arc::clone(&waiting_for_token),
            );
            Self {
                stream_id,
                endpoint,
                controllable: ControllableId::next(),
                scope,
                connection,
                msg_out,
                core: Mutex::new(engine),
                bw_configure: RwLock::new(None),
                waiting_for_token,
                client_buffer: RwLock::new(0),
                created_at: Instant::now(),
            }
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

    pub fn state(&self) -> StreamState {
        self.core.lock().state
    }

    pub fn is_paused(&self) -> bool {
        self.state() == StreamState::Paused
    }

    /// Source chosen for the current item
    pub fn decision(&self) -> PlayDecision {
        self.core.lock().decision()
    }

    /// Run `f` with the engine locked
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut PlayEngine) -> R) -> R {
        let mut engine = self.core.lock();
        f(&mut engine)
    }

    /// Register for bandwidth control and move to `Stopped`
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let controllable: Arc<dyn BandwidthControllable> = self.clone();
        let context = self.scope.services().bandwidth.register(&controllable);

        let info = self.with_engine(|engine| {
            engine.start()?;
            engine.set_bandwidth(context);
            Ok::<_, Error>(engine.info())
        });
        let info = match info {
            Ok(info) => info,
            Err(e) => {
                self.scope.services().bandwidth.unregister(&context);
                return Err(e);
            }
        };

        tracing::info!(stream_id = self.stream_id, connection = %self.connection.id(), "Subscriber stream started");
        self.scope
            .notify("subscriber_start", &info, |h, s| h.subscriber_start(s));
        Ok(())
    }

    /// Play the playlist from the cursor
    ///
    /// Items that cannot be found are skipped; the call fails only when the
    /// playlist is empty or the stream is in the wrong state.
    pub fn play(&self) -> Result<()> {
        self.with_engine(|engine| {
            if engine.playlist.is_empty() {
                return Err(Error::NoPlaylistItems);
            }
            if engine.playlist.current_index().is_none() {
                engine.playlist.move_next();
            }
            let mut remaining = engine.playlist.len();
            while remaining > 0 {
                remaining -= 1;
                let Some(item) = engine.playlist.current_item().cloned() else {
                    break;
                };
                match engine.play(item, true) {
                    Ok(()) => break,
                    Err(Error::StreamNotFound(name)) => {
                        tracing::debug!(stream_id = self.stream_id, name = %name, "Item not found, trying next");
                        if engine.playlist.move_next().is_none() {
                            break;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    /// Skip to the next item
    pub fn next_item(&self) {
        self.with_engine(|engine| {
            Self::stop_for_switch(engine);
            if engine.playlist.move_next().is_none() {
                return;
            }
            Self::play_from_cursor(engine, true, false);
        });
    }

    /// Go back to the previous item
    pub fn previous_item(&self) {
        self.with_engine(|engine| {
            Self::stop_for_switch(engine);
            if engine.playlist.move_previous().is_none() {
                return;
            }
            Self::play_from_cursor(engine, false, true);
        });
    }

    /// Jump to the item at `index`
    pub fn set_item(&self, index: usize) {
        self.with_engine(|engine| {
            let Some(item) = engine.playlist.item(index).cloned() else {
                tracing::debug!(stream_id = self.stream_id, index = index, "No playlist item at index");
                return;
            };
            Self::stop_for_switch(engine);
            engine.playlist.set_current_index(Some(index));
            if let Err(e) = engine.play(item, true) {
                tracing::warn!(stream_id = self.stream_id, error = %e, "Failed to play selected item");
            }
        });
    }

    /// Stop the current item before the cursor moves
    fn stop_for_switch(engine: &mut PlayEngine) {
        if !matches!(engine.state, StreamState::Playing | StreamState::Paused) {
            return;
        }
        if let Err(e) = engine.stop_current() {
            tracing::warn!(stream_id = engine.info().stream_id, error = %e, "Failed to stop current item");
        }
    }

    /// Play the item under the cursor, moving on past missing items
    fn play_from_cursor(engine: &mut PlayEngine, forward: bool, with_reset: bool) {
        let mut remaining = engine.playlist.len();
        while remaining > 0 {
            remaining -= 1;
            let Some(item) = engine.playlist.current_item().cloned() else {
                break;
            };
            match engine.play(item, with_reset) {
                Ok(()) => break,
                Err(Error::StreamNotFound(_) | Error::Io(_)) => {
                    let moved = if forward {
                        engine.playlist.move_next()
                    } else {
                        engine.playlist.move_previous()
                    };
                    if moved.is_none() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Playlist item failed to play");
                    break;
                }
            }
        }
    }

    pub fn stop(&self) -> Result<()> {
        self.with_engine(|engine| engine.stop())
    }

    pub fn pause(&self, position: i64) -> Result<()> {
        self.with_engine(|engine| engine.pause(position))
    }

    pub fn resume(&self, position: i64) -> Result<()> {
        self.with_engine(|engine| engine.resume(position))
    }

    pub fn seek(&self, position: i64) -> Result<()> {
        self.with_engine(|engine| engine.seek(position))
    }

    pub fn receive_video(&self, receive: bool) {
        self.with_engine(|engine| engine.receive_video(receive));
    }

    pub fn receive_audio(&self, receive: bool) {
        self.with_engine(|engine| engine.receive_audio(receive));
    }

    /// Close the stream for good
    pub fn close(&self) {
        let closed = self.with_engine(|engine| {
            if engine.state == StreamState::Closed {
                return None;
            }
            engine.close();
            Some((engine.info(), engine.take_bandwidth()))
        });
        let Some((info, bandwidth)) = closed else {
            return;
        };
        if let Some(context) = bandwidth {
            self.scope.services().bandwidth.unregister(&context);
        }
        tracing::info!(stream_id = self.stream_id, connection = %self.connection.id(), "Subscriber stream closed");
        self.scope
            .notify("subscriber_close", &info, |h, s| h.subscriber_close(s));
    }

    // ----- playlist -----

    pub fn add_item(&self, item: PlayItem) {
        self.with_engine(|engine| engine.playlist.add_item(item));
    }

    pub fn add_item_at(&self, item: PlayItem, index: usize) {
        self.with_engine(|engine| engine.playlist.add_item_at(item, index));
    }

    pub fn remove_item(&self, index: usize) -> Option<PlayItem> {
        self.with_engine(|engine| engine.playlist.remove_item(index))
    }

    /// Stop playback and empty the playlist
    pub fn remove_all_items(&self) {
        self.with_engine(|engine| {
            Self::stop_for_switch(engine);
            engine.playlist.clear();
        });
    }

    pub fn item_count(&self) -> usize {
        self.with_engine(|engine| engine.playlist.len())
    }

    pub fn item(&self, index: usize) -> Option<PlayItem> {
        self.with_engine(|engine| engine.playlist.item(index).cloned())
    }

    pub fn current_item_index(&self) -> Option<usize> {
        self.with_engine(|engine| engine.playlist.current_index())
    }

    /// Item being played
    pub fn current_item(&self) -> Option<PlayItem> {
        self.with_engine(|engine| engine.current_item().cloned())
    }

    pub fn has_more_items(&self) -> bool {
        self.with_engine(|engine| engine.playlist.has_more_items())
    }

    pub fn set_random(&self, random: bool) {
        self.with_engine(|engine| engine.playlist.set_random(random));
    }

    pub fn is_random(&self) -> bool {
        self.with_engine(|engine| engine.playlist.is_random())
    }

    pub fn set_rewind(&self, rewind: bool) {
        self.with_engine(|engine| engine.playlist.set_rewind(rewind));
    }

    pub fn is_rewind(&self) -> bool {
        self.with_engine(|engine| engine.playlist.is_rewind())
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.with_engine(|engine| engine.playlist.set_repeat(repeat));
    }

    pub fn is_repeat(&self) -> bool {
        self.with_engine(|engine| engine.playlist.is_repeat())
    }

    pub fn set_playlist_controller(&self, controller: Option<Arc<dyn PlaylistController>>) {
        self.with_engine(|engine| engine.playlist.set_controller(controller));
    }

    // ----- client feedback -----

    /// Buffer length the client asked for, in milliseconds
    pub fn set_client_buffer_duration(&self, buffer_ms: i64) {
        *self.client_buffer.write() = buffer_ms;
        self.with_engine(|engine| engine.set_client_buffer(buffer_ms));
    }

    pub fn client_buffer_duration(&self) -> i64 {
        *self.client_buffer.read()
    }

    /// The connection flushed a message of this stream
    pub fn written(&self) {
        self.with_engine(|engine| engine.on_written());
    }

    pub fn statistics(&self) -> PlaybackStats {
        self.with_engine(|engine| engine.statistics())
    }

    /// Change the stream's bandwidth limits
    pub fn set_bandwidth_configure(&self, configure: Option<BandwidthConfigure>) {
        *self.bw_configure.write() = configure;
        let context = self.with_engine(|engine| engine.bandwidth_context());
        if let Some(context) = context {
            self.scope.services().bandwidth.update_bw_configure(&context);
        }
    }
}

impl MessageComponent for PlaylistSubscriberStream {
    fn endpoint_id(&self) -> EndpointId {
        self.endpoint
    }

    fn on_oob_control_message(&self, _pipe: &Pipe, msg: &mut OobControlMessage) {
        if msg.target == OobTarget::ConnectionConsumer {
            self.msg_out.send_oob_to_consumers(msg);
        }
    }

    fn on_pipe_connection_event(&self, _pipe: &Pipe, event: &PipeConnectionEvent) {
        match event {
            PipeConnectionEvent::ProviderConnectPush(_) => {
                self.with_engine(|engine| engine.on_provider_connect());
            }
            PipeConnectionEvent::ProviderDisconnect(_) => {
                self.with_engine(|engine| engine.on_provider_disconnect());
            }
            _ => {}
        }
    }
}

impl Consumer for PlaylistSubscriberStream {
    fn push_message(&self, _pipe: &Pipe, message: &PipeMessage) -> Result<()> {
        self.with_engine(|engine| engine.push_live(message))
    }
}

impl TokenBucketCallback for PlaylistSubscriberStream {
    fn available(&self, _bucket: &dyn TokenBucket, _tokens: u64) {
        self.with_engine(|engine| engine.on_tokens_available());
    }

    fn reset(&self, _bucket: &dyn TokenBucket, _tokens: u64) {
        self.waiting_for_token.store(false, Ordering::Release);
    }
}

impl BandwidthControllable for PlaylistSubscriberStream {
    fn controllable_id(&self) -> ControllableId {
        self.controllable
    }

    fn parent_controllable(&self) -> Option<ControllableId> {
        self.connection.controllable_id()
    }

    fn bandwidth_configure(&self) -> Option<BandwidthConfigure> {
        self.bw_configure.read().clone()
    }
}

impl std::fmt::Debug for PlaylistSubscriberStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaylistSubscriberStream")
            .field("stream_id", &self.stream_id)
            .field("connection", &self.connection.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use std::time::Duration;

    use super::*;
    use crate::bandwidth::VIDEO;
    use crate::media::FlvTag;
    use crate::messaging::{EventBody, StatusCode};
    use crate::testing::Fixture;

    fn video_timestamps(fixture: &Fixture) -> Vec<i64> {
        fixture
            .connection
            .events(1)
            .iter()
            .filter(|e| e.is_video())
            .map(|e| e.timestamp)
            .collect()
    }

    fn clip(duration_ms: u32) -> Vec<FlvTag> {
        (0..duration_ms)
            .step_by(100)
            .map(|ts| {
                let header = if ts % 1000 == 0 { 0x12 } else { 0x22 };
                FlvTag::video(ts, Bytes::from(vec![header, 0x00]))
            })
            .collect()
    }

    #[test]
    fn test_start_and_close_lifecycle() {
        let fixture = Fixture::new();
        let stream = fixture.subscriber(1);
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(stream.start().is_err());

        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
        // Second close is a no-op
        stream.close();
        assert_eq!(fixture.handler.calls(), vec!["subscriber_start", "subscriber_close"]);
    }

    #[test]
    fn test_play_empty_playlist() {
        let fixture = Fixture::new();
        let stream = fixture.subscriber(1);
        assert!(matches!(stream.play(), Err(Error::NoPlaylistItems)));
    }

    #[test]
    fn test_playlist_skips_missing_items() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/b.flv", clip(1000));
        let stream = fixture.subscriber(1);
        stream.add_item(PlayItem::new("a").start(0));
        stream.add_item(PlayItem::new("b").start(0));

        stream.play().unwrap();
        assert_eq!(stream.current_item_index(), Some(1));
        assert_eq!(stream.current_item().unwrap().name, "b");
        assert_eq!(stream.state(), StreamState::Playing);
        assert_eq!(
            fixture.connection.statuses(1),
            vec![
                StatusCode::PlayStreamNotFound,
                StatusCode::PlayReset,
                StatusCode::PlayStart
            ]
        );
    }

    #[test]
    fn test_playlist_advances_with_switch() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/a.flv", clip(500));
        fixture.files.insert("streams/b.flv", clip(500));
        let stream = fixture.subscriber(1);
        stream.add_item(PlayItem::new("a").start(0));
        stream.add_item(PlayItem::new("b").start(0));

        stream.play().unwrap();
        fixture.scheduler.advance(450);
        assert_eq!(stream.current_item_index(), Some(1));

        let switched = fixture.connection.events(1).iter().any(|e| {
            matches!(&e.body, EventBody::PlayStatus(s) if s.code == "NetStream.Play.Switch")
        });
        assert!(switched);

        // The second item continues the first item's timeline
        let video: Vec<i64> = fixture
            .connection
            .events(1)
            .iter()
            .filter(|e| e.is_video())
            .map(|e| e.timestamp)
            .collect();
        assert!(video.windows(2).all(|w| w[0] <= w[1]));
        assert!(*video.last().unwrap() >= 400);
    }

    #[test]
    fn test_next_item_switches_without_reset() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/a.flv", clip(5000));
        fixture.files.insert("streams/b.flv", clip(5000));
        let stream = fixture.subscriber(1);
        stream.add_item(PlayItem::new("a").start(0));
        stream.add_item(PlayItem::new("b").start(0));
        stream.play().unwrap();
        fixture.connection.clear();

        stream.next_item();
        assert_eq!(stream.current_item().unwrap().name, "b");
        assert_eq!(stream.state(), StreamState::Playing);
        assert!(!fixture.connection.statuses(1).contains(&StatusCode::PlayReset));
        let switched = fixture.connection.events(1).iter().any(|e| {
            matches!(&e.body, EventBody::PlayStatus(s) if s.code == "NetStream.Play.Switch")
        });
        assert!(switched);

        // Going back is a user jump and resets the client
        fixture.connection.clear();
        stream.previous_item();
        assert_eq!(stream.current_item().unwrap().name, "a");
        assert!(fixture.connection.statuses(1).contains(&StatusCode::PlayReset));
    }

    #[test]
    fn test_next_item_on_single_item_stops() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/a.flv", clip(5000));
        let stream = fixture.subscriber(1);
        stream.add_item(PlayItem::new("a").start(0));
        stream.play().unwrap();

        stream.next_item();
        assert_eq!(stream.current_item_index(), None);
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(fixture.scheduler.pending_jobs(), 0);

        stream.previous_item();
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn test_set_item_and_previous() {
        let fixture = Fixture::new();
        for name in ["a", "b", "c"] {
            fixture.files.insert(format!("streams/{}.flv", name), clip(5000));
        }
        let stream = fixture.subscriber(1);
        for name in ["a", "b", "c"] {
            stream.add_item(PlayItem::new(name).start(0));
        }
        stream.play().unwrap();

        stream.set_item(2);
        assert_eq!(stream.current_item().unwrap().name, "c");
        stream.previous_item();
        assert_eq!(stream.current_item().unwrap().name, "b");
        assert_eq!(stream.state(), StreamState::Playing);

        // Out of range leaves playback alone
        stream.set_item(9);
        assert_eq!(stream.current_item().unwrap().name, "b");

        stream.remove_all_items();
        assert_eq!(stream.item_count(), 0);
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn test_close_cancels_jobs() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/a.flv", clip(5000));
        let stream = fixture.subscriber(1);
        stream.add_item(PlayItem::new("a").start(0));
        stream.play().unwrap();
        assert_eq!(fixture.scheduler.pending_jobs(), 1);

        stream.close();
        assert_eq!(fixture.scheduler.pending_jobs(), 0);
        fixture.connection.clear();
        fixture.scheduler.advance(1000);
        assert!(fixture.connection.events(1).is_empty());
    }

    #[test]
    fn test_receive_audio_off_sends_blank_audio() {
        let fixture = Fixture::new();
        let tags: Vec<FlvTag> = (0..20u32)
            .map(|i| FlvTag::audio(i * 50, Bytes::from_static(&[0x2F, 0x01, 0x02])))
            .collect();
        fixture.files.insert("streams/song.flv", tags);
        let stream = fixture.subscriber(1);
        stream.add_item(PlayItem::new("song").start(0));
        stream.play().unwrap();
        fixture.scheduler.advance(120);

        stream.receive_audio(false);
        fixture.connection.clear();
        fixture.scheduler.advance(500);

        let audio: Vec<_> = fixture
            .connection
            .events(1)
            .into_iter()
            .filter(|e| e.is_audio())
            .collect();
        // The frame already due goes out, then one blank frame and silence
        assert_eq!(audio.iter().filter(|e| e.size() == 0).count(), 1);
        assert!(audio.iter().filter(|e| e.size() > 0).all(|e| e.timestamp <= 150));
        assert!(audio.len() <= 2);
    }

    #[test]
    fn test_statistics_and_buffer() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/a.flv", clip(2000));
        let stream = fixture.subscriber(1);
        stream.set_client_buffer_duration(1000);
        assert_eq!(stream.client_buffer_duration(), 1000);
        stream.add_item(PlayItem::new("a").start(0));
        stream.play().unwrap();
        fixture.scheduler.advance(300);

        let stats = stream.statistics();
        assert_eq!(stats.current_timestamp, 300);
        assert_eq!(stats.bytes_sent, 4 * 2);
    }

    #[test]
    fn test_token_wait_resumes_on_available() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/a.flv", clip(1000));
        let stream = fixture.subscriber(1);
        // One byte per second and an empty reserve
        stream.set_bandwidth_configure(Some(
            BandwidthConfigure::default().video(8).initial_burst(VIDEO, 0),
        ));
        stream.add_item(PlayItem::new("a").start(0));
        stream.play().unwrap();

        fixture.scheduler.advance(100);
        assert!(stream.waiting_for_token.load(Ordering::Acquire));
        assert_eq!(video_timestamps(&fixture), vec![0]);
        // No retry is scheduled while waiting for tokens
        assert_eq!(fixture.scheduler.pending_jobs(), 0);

        fixture
            .bandwidth
            .distribute_tokens_at(Instant::now() + Duration::from_secs(10));
        assert!(!stream.waiting_for_token.load(Ordering::Acquire));
        assert_eq!(video_timestamps(&fixture), vec![0, 100]);
    }

    #[test]
    fn test_granted_tokens_survive_backlog() {
        let fixture = Fixture::new();
        fixture.files.insert("streams/a.flv", clip(1000));
        let stream = fixture.subscriber(1);
        stream.set_bandwidth_configure(Some(
            BandwidthConfigure::default().video(8).initial_burst(VIDEO, 0),
        ));
        stream.add_item(PlayItem::new("a").start(0));
        stream.play().unwrap();
        fixture.scheduler.advance(100);
        assert!(stream.waiting_for_token.load(Ordering::Acquire));
        let context = stream.with_engine(|e| e.bandwidth_context()).unwrap();

        // Tokens arrive while the connection is backed up
        fixture.connection.set_pending(50, 0);
        fixture
            .bandwidth
            .distribute_tokens_at(Instant::now() + Duration::from_secs(10));
        assert_eq!(video_timestamps(&fixture), vec![0]);
        let reserve = fixture.bandwidth.tokens(&context).unwrap()[VIDEO];

        fixture.connection.set_pending(0, 0);
        fixture.scheduler.advance(20);
        assert_eq!(video_timestamps(&fixture), vec![0, 100]);
        // The deferred message is sent on the earlier grant
        assert_eq!(fixture.bandwidth.tokens(&context).unwrap()[VIDEO], reserve);
    }
}
