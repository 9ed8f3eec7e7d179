//! Streams: playback, publishing and server-side broadcasts
//!
//! This module provides:
//! - [`PlaylistSubscriberStream`], a client playing a playlist through its
//!   play engine
//! - [`ClientBroadcastStream`], a client publishing a live stream
//! - [`ServerStream`], a playlist broadcast under a name of its own
//! - [`StreamAwareHandler`] callbacks and the [`StreamScope`] services
//!   every stream of an application shares
//!
//! ```text
//!   ClientBroadcastStream ──► BroadcastScope ──► PlaylistSubscriberStream ──► connection
//!   ServerStream ─────────────┘    (live)        ▲
//!                                                │ pull, paced by the scheduler
//!   FileProvider ──► pull pipe ──────────────────┘ (VOD)
//! ```

pub mod broadcast;
pub mod config;
pub mod context;
pub mod dropper;
pub mod engine;
pub mod handler;
pub mod playlist;
pub mod server;
pub mod state;
pub mod subscriber;

pub use broadcast::ClientBroadcastStream;
pub use config::EngineConfig;
pub use context::{StreamScope, StreamServices};
pub use dropper::{DropperState, VideoFrameDropper};
pub use engine::PlayDecision;
pub use handler::{HandlerResult, StreamAwareHandler, StreamInfo, StreamKind, StreamListener};
pub use playlist::{Playlist, PlaylistController, SimplePlaylistController};
pub use server::ServerStream;
pub use state::{PlayItem, PublishMode, StreamState, START_LIVE, START_LIVE_OR_VOD};
pub use subscriber::PlaylistSubscriberStream;
