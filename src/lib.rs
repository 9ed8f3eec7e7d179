//! RTMP stream delivery engine
//!
//! The delivery core of an RTMP media server: publishers feed broadcast
//! scopes, subscribers play playlists of live and recorded items, and every
//! hop between them is a [`Pipe`](messaging::Pipe).
//!
//! This crate provides:
//! - Provider/consumer pipes with out-of-band control messages
//! - Per-subscriber play engines pacing VOD and relaying live streams
//! - A live video frame dropper and hierarchical token-bucket bandwidth
//!   control
//! - Client broadcast streams (publish, record, append) and server-side
//!   playlist broadcasts
//! - A NetStream-style command facade, [`StreamService`]
//!
//! Sockets, chunking and AMF encoding are out of scope; the transport plugs
//! in through [`StreamConnection`](connection::StreamConnection).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rtmp_delivery::prelude::*;
//!
//! let scheduler = Arc::new(TokioScheduler::new(tokio::runtime::Handle::current()));
//! let files = MemoryFileStore::new();
//! let services = StreamServices {
//!     scheduler,
//!     clock: Arc::new(SystemClock::new()),
//!     providers: ProviderService::new(files, Arc::new(DefaultStreamFilenameGenerator)),
//!     consumers: ConsumerService::new(),
//!     bandwidth: Arc::new(SimpleBandwidthControlService::new()),
//!     engine_config: EngineConfig::default(),
//! };
//! let service = StreamService::new(StreamScope::new("live", services));
//!
//! let handle = registry.register(&connection);
//! let id = service.create_stream(&handle);
//! service.play(&handle, id, "cam1", START_LIVE_OR_VOD, -1, true)?;
//! ```

pub mod bandwidth;
pub mod connection;
pub mod error;
pub mod media;
pub mod messaging;
pub mod registry;
pub mod scheduling;
pub mod service;
pub mod stats;
pub mod stream;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use service::StreamService;

/// Common imports
pub mod prelude {
    pub use crate::bandwidth::{
        BandwidthConfig, BandwidthConfigure, BandwidthControlService,
        SimpleBandwidthControlService,
    };
    pub use crate::connection::{
        ConnectionHandle, ConnectionId, ConnectionRegistry, ConsumerService, Outbound,
        StreamConnection,
    };
    pub use crate::error::{Error, Result};
    pub use crate::messaging::{PipeMessage, RtmpEvent, Status, StatusCode};
    pub use crate::registry::{
        DefaultStreamFilenameGenerator, MemoryFileStore, ProviderService, StreamableFileFactory,
    };
    pub use crate::scheduling::{Clock, Scheduler, SystemClock, TokioScheduler};
    pub use crate::service::StreamService;
    pub use crate::stream::{
        ClientBroadcastStream, EngineConfig, PlayItem, PlaylistSubscriberStream, PublishMode,
        ServerStream, StreamAwareHandler, StreamScope, StreamServices, START_LIVE,
        START_LIVE_OR_VOD,
    };
}
