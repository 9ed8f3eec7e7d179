//! Application callbacks for stream lifecycle events
//!
//! An application installs a [`StreamAwareHandler`] on its
//! [`StreamScope`](super::context::StreamScope) to hear about publishers and
//! subscribers coming and going. All methods have default no-op
//! implementations, so a handler only overrides what it cares about.
//!
//! Handlers receive a [`StreamInfo`] snapshot rather than the stream itself.
//! Callbacks run synchronously while the stream is locked, so they must not
//! call back into the stream that raised them. A failing callback is logged
//! and never interrupts delivery.

use crate::connection::ConnectionId;
use crate::messaging::RtmpEvent;

use super::state::PlayItem;

/// Result returned by handler callbacks
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// What kind of stream an event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Client playing a playlist
    Subscriber,
    /// Client publishing
    Broadcast,
    /// Server-side playlist broadcast
    Server,
}

/// Snapshot of a stream passed to callbacks
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Message stream id (0 for server streams)
    pub stream_id: u32,

    /// Owning connection, `None` for server streams
    pub connection: Option<ConnectionId>,

    /// Application name
    pub app: String,

    /// Published name, or the name of the item being played
    pub name: Option<String>,

    pub kind: StreamKind,
}

impl StreamInfo {
    pub fn new(stream_id: u32, app: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            stream_id,
            connection: None,
            app: app.into(),
            name: None,
            kind,
        }
    }

    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}

/// Application-level stream callbacks
pub trait StreamAwareHandler: Send + Sync {
    /// A live publish session started
    fn publish_start(&self, _stream: &StreamInfo) -> HandlerResult {
        Ok(())
    }

    /// A recording publish session started
    fn record_start(&self, _stream: &StreamInfo) -> HandlerResult {
        Ok(())
    }

    /// A broadcast stream started delivering
    fn broadcast_start(&self, _stream: &StreamInfo) -> HandlerResult {
        Ok(())
    }

    fn broadcast_close(&self, _stream: &StreamInfo) -> HandlerResult {
        Ok(())
    }

    fn subscriber_start(&self, _stream: &StreamInfo) -> HandlerResult {
        Ok(())
    }

    fn subscriber_close(&self, _stream: &StreamInfo) -> HandlerResult {
        Ok(())
    }

    /// A playlist item started playing
    fn playlist_item_play(&self, _stream: &StreamInfo, _item: &PlayItem, _is_live: bool) -> HandlerResult {
        Ok(())
    }

    fn playlist_item_stop(&self, _stream: &StreamInfo, _item: &PlayItem) -> HandlerResult {
        Ok(())
    }

    fn vod_item_pause(&self, _stream: &StreamInfo, _item: &PlayItem, _position: i64) -> HandlerResult {
        Ok(())
    }

    fn vod_item_resume(&self, _stream: &StreamInfo, _item: &PlayItem, _position: i64) -> HandlerResult {
        Ok(())
    }

    fn vod_item_seek(&self, _stream: &StreamInfo, _item: &PlayItem, _position: i64) -> HandlerResult {
        Ok(())
    }
}

/// Observer of every packet a broadcast stream ingests
pub trait StreamListener: Send + Sync {
    fn packet_received(&self, stream: &StreamInfo, packet: &RtmpEvent) -> HandlerResult;
}

/// Log a failed callback
pub(crate) fn log_failure(callback: &'static str, stream: &StreamInfo, result: HandlerResult) {
    if let Err(e) = result {
        tracing::error!(
            callback = callback,
            app = %stream.app,
            stream_id = stream.stream_id,
            error = %e,
            "Stream handler failed"
        );
    }
}
