//! NetStream command facade
//!
//! One [`StreamService`] serves an application. The protocol layer calls it
//! with the connection a command arrived on and the message stream id the
//! command addresses; failures the client must hear about are reported as
//! NetStream status messages on that stream and returned to the caller.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{ClientStream, ConnectionHandle, ConnectionId, ConnectionStreams, Outbound};
use crate::error::{Error, Result};
use crate::messaging::{Status, StatusCode};
use crate::stream::{
    ClientBroadcastStream, PlayItem, PlaylistSubscriberStream, PublishMode, StreamScope,
    StreamState,
};

/// Stream commands of one application
pub struct StreamService {
    scope: Arc<StreamScope>,
    connections: DashMap<ConnectionId, Arc<ConnectionStreams>>,
}

impl StreamService {
    pub fn new(scope: Arc<StreamScope>) -> Self {
        Self {
            scope,
            connections: DashMap::new(),
        }
    }

    pub fn scope(&self) -> &Arc<StreamScope> {
        &self.scope
    }

    /// Stream table of a connection, created on first use
    pub fn streams(&self, connection: &ConnectionHandle) -> Arc<ConnectionStreams> {
        self.connections
            .entry(connection.id())
            .or_insert_with(|| Arc::new(ConnectionStreams::new()))
            .clone()
    }

    /// `createStream`: reserve a message stream id
    pub fn create_stream(&self, connection: &ConnectionHandle) -> u32 {
        let id = self.streams(connection).reserve();
        tracing::debug!(connection = %connection.id(), stream_id = id, "Stream created");
        id
    }

    /// `publish`: start publishing `name` on `stream_id`
    pub fn publish(
        &self,
        connection: &ConnectionHandle,
        stream_id: u32,
        name: &str,
        mode: PublishMode,
    ) -> Result<()> {
        if name.is_empty() {
            self.send_status(connection, stream_id, StatusCode::Failed, name, "The stream name may not be empty.");
            return Err(Error::BadName(String::new()));
        }

        let providers = &self.scope.services().providers;
        let taken = providers
            .live_provider_input(self.scope.app(), name, false)
            .map(|scope| scope.provider_count() > 0)
            .unwrap_or(false);
        if taken {
            tracing::info!(connection = %connection.id(), name = name, "Publish refused, name in use");
            self.send_status(connection, stream_id, StatusCode::PublishBadName, name, "");
            return Err(Error::BadName(name.to_string()));
        }

        let streams = self.streams(connection);
        let (stream, created) = match streams.get(stream_id) {
            Some(ClientStream::Broadcast(stream)) => (stream, false),
            Some(ClientStream::Subscriber(_)) => {
                self.send_status(connection, stream_id, StatusCode::Failed, name, "Stream is playing.");
                return Err(Error::illegal_state("publish", "playing"));
            }
            None => (
                ClientBroadcastStream::new(stream_id, Arc::clone(&self.scope), connection.clone()),
                true,
            ),
        };

        stream.set_published_name(name);
        stream.start();
        let recorded = match mode {
            PublishMode::Live => Ok(()),
            PublishMode::Record => stream.save_as(name, false),
            PublishMode::Append => stream.save_as(name, true),
        };
        if let Err(e) = recorded {
            tracing::error!(connection = %connection.id(), name = name, error = %e, "Recording cannot be opened");
            self.send_status(connection, stream_id, StatusCode::RecordNoAccess, name, &e.to_string());
            return Err(e);
        }

        if let Err(e) = stream.start_publishing() {
            stream.stop_recording();
            self.send_status(connection, stream_id, StatusCode::PublishBadName, name, "");
            return Err(e);
        }
        if created {
            streams.insert(ClientStream::Broadcast(stream));
        }
        Ok(())
    }

    /// `play`: queue `name` on `stream_id` and start playing
    ///
    /// With `flush` the playlist is replaced; without it the item is queued
    /// behind a playlist that is already playing.
    pub fn play(
        &self,
        connection: &ConnectionHandle,
        stream_id: u32,
        name: &str,
        start: i64,
        length: i64,
        flush: bool,
    ) -> Result<()> {
        if name.is_empty() {
            self.send_status(connection, stream_id, StatusCode::Failed, name, "The stream name may not be empty.");
            return Err(Error::StreamNotFound(String::new()));
        }

        let streams = self.streams(connection);
        let stream = match streams.get(stream_id) {
            Some(ClientStream::Subscriber(stream)) => stream,
            Some(ClientStream::Broadcast(_)) => {
                self.send_status(connection, stream_id, StatusCode::Failed, name, "Stream is publishing.");
                return Err(Error::illegal_state("play", "publishing"));
            }
            None => {
                let stream = PlaylistSubscriberStream::new(
                    stream_id,
                    Arc::clone(&self.scope),
                    connection.clone(),
                );
                stream.start()?;
                streams.insert(ClientStream::Subscriber(Arc::clone(&stream)));
                stream
            }
        };

        if flush {
            stream.remove_all_items();
        }
        stream.add_item(PlayItem::new(name).start(start).length(length));
        if !flush && matches!(stream.state(), StreamState::Playing | StreamState::Paused) {
            return Ok(());
        }

        stream.play().map_err(|e| {
            if e.is_io() {
                self.send_status(connection, stream_id, StatusCode::Failed, name, &e.to_string());
            }
            e
        })
    }

    /// `pause`: pause or resume at `position`
    pub fn pause(&self, connection: &ConnectionHandle, stream_id: u32, pause: bool, position: i64) -> Result<()> {
        let stream = self.subscriber(connection, stream_id)?;
        let result = if pause {
            stream.pause(position)
        } else {
            stream.resume(position)
        };
        result.map_err(|e| {
            if matches!(e, Error::IllegalState { .. }) {
                let name = stream.current_item().map(|i| i.name).unwrap_or_default();
                self.send_status(connection, stream_id, StatusCode::Failed, &name, &e.to_string());
            }
            e
        })
    }

    /// `seek`: reports `NetStream.Seek.Failed` when the stream cannot seek
    pub fn seek(&self, connection: &ConnectionHandle, stream_id: u32, position: i64) -> Result<()> {
        let stream = self.subscriber(connection, stream_id)?;
        stream.seek(position).map_err(|e| {
            if matches!(e, Error::NotSupported(_) | Error::IllegalState { .. }) {
                let name = stream.current_item().map(|i| i.name).unwrap_or_default();
                self.send_status(connection, stream_id, StatusCode::SeekFailed, &name, &e.to_string());
            }
            e
        })
    }

    pub fn receive_audio(&self, connection: &ConnectionHandle, stream_id: u32, receive: bool) -> Result<()> {
        self.subscriber(connection, stream_id)?.receive_audio(receive);
        Ok(())
    }

    pub fn receive_video(&self, connection: &ConnectionHandle, stream_id: u32, receive: bool) -> Result<()> {
        self.subscriber(connection, stream_id)?.receive_video(receive);
        Ok(())
    }

    /// `closeStream`: close the stream but keep its id reserved
    pub fn close_stream(&self, connection: &ConnectionHandle, stream_id: u32) {
        let Some(streams) = self.connections.get(&connection.id()).map(|s| Arc::clone(s.value())) else {
            return;
        };
        if let Some(stream) = streams.remove(stream_id) {
            stream.close();
        }
    }

    /// `deleteStream`: close the stream and release its id
    pub fn delete_stream(&self, connection: &ConnectionHandle, stream_id: u32) {
        self.close_stream(connection, stream_id);
        if let Some(streams) = self.connections.get(&connection.id()) {
            streams.unreserve(stream_id);
        }
    }

    /// Close everything a connection left behind
    pub fn release_connection(&self, connection: ConnectionId) {
        if let Some((_, streams)) = self.connections.remove(&connection) {
            tracing::debug!(connection = %connection, streams = streams.len(), "Releasing connection streams");
            streams.close_all();
        }
    }

    fn subscriber(&self, connection: &ConnectionHandle, stream_id: u32) -> Result<Arc<PlaylistSubscriberStream>> {
        self.connections
            .get(&connection.id())
            .and_then(|streams| streams.get(stream_id))
            .and_then(|stream| stream.as_subscriber().cloned())
            .ok_or_else(|| Error::StreamNotFound(format!("stream {}", stream_id)))
    }

    fn send_status(&self, connection: &ConnectionHandle, stream_id: u32, code: StatusCode, name: &str, description: &str) {
        let mut status = Status::new(code, stream_id).details(name);
        if !description.is_empty() {
            status = status.description(description);
        }
        if let Err(e) = connection.write(stream_id, Outbound::Status(status)) {
            tracing::warn!(connection = %connection.id(), stream_id = stream_id, error = %e, "Failed to send status");
        }
    }
}

impl std::fmt::Debug for StreamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamService")
            .field("app", &self.scope.app())
            .field("connections", &self.connections.len())
            .finish()
    }
}
