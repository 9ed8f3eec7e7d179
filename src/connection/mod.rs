//! Client connection side
//!
//! The transport (chunking, handshake, sockets) lives elsewhere; the delivery
//! engine only needs a [`StreamConnection`] it can write to and ask for queue
//! depths. Streams never own their connection: they keep a
//! [`ConnectionHandle`] and look the connection up on every use, so a closed
//! connection simply stops receiving writes.

pub mod consumer;
pub mod streams;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::bandwidth::ControllableId;
use crate::error::Result;
use crate::messaging::{RtmpEvent, Status};

pub use consumer::{ConnectionConsumer, ConsumerService};
pub use streams::{ClientStream, ConnectionStreams};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message written to a client on one of its streams
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(RtmpEvent),
    Status(Status),
    /// New outgoing chunk size
    ChunkSize(u32),
}

/// Byte channel to one client
pub trait StreamConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Messages queued for writing on the whole connection
    fn pending_messages(&self) -> u64;

    /// Video messages queued for one stream
    fn pending_video_messages(&self, stream_id: u32) -> u64;

    fn written_bytes(&self) -> u64;

    /// Bytes the client acknowledged reading
    fn client_bytes_read(&self) -> u64;

    fn write(&self, stream_id: u32, message: Outbound) -> Result<()>;

    /// Bandwidth controllable streams on this connection are charged to
    fn controllable_id(&self) -> Option<ControllableId> {
        None
    }
}

/// Live connections by id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Weak<dyn StreamConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a connection and return a handle to it
    pub fn register(self: &Arc<Self>, connection: &Arc<dyn StreamConnection>) -> ConnectionHandle {
        let id = connection.id();
        self.connections.insert(id, Arc::downgrade(connection));
        tracing::debug!(connection = %id, "Connection registered");
        ConnectionHandle {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn unregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            tracing::debug!(connection = %id, "Connection unregistered");
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<dyn StreamConnection>> {
        self.connections.get(&id).and_then(|c| c.upgrade())
    }

    /// Handle for an already registered connection
    pub fn handle(self: &Arc<Self>, id: ConnectionId) -> ConnectionHandle {
        ConnectionHandle {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Non-owning reference to a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection, if it is still open
    pub fn get(&self) -> Option<Arc<dyn StreamConnection>> {
        self.registry.get(self.id)
    }

    /// Write to the connection; dropped if it has gone away
    pub fn write(&self, stream_id: u32, message: Outbound) -> Result<()> {
        match self.get() {
            Some(connection) => connection.write(stream_id, message),
            None => {
                tracing::debug!(connection = %self.id, stream_id = stream_id, "Connection gone, dropping message");
                Ok(())
            }
        }
    }

    pub fn pending_messages(&self) -> u64 {
        self.get().map(|c| c.pending_messages()).unwrap_or(0)
    }

    pub fn pending_video_messages(&self, stream_id: u32) -> u64 {
        self.get()
            .map(|c| c.pending_video_messages(stream_id))
            .unwrap_or(0)
    }

    pub fn controllable_id(&self) -> Option<ControllableId> {
        self.get().and_then(|c| c.controllable_id())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;

    #[test]
    fn test_handle_does_not_keep_connection_alive() {
        let registry = ConnectionRegistry::new();
        let connection: Arc<dyn StreamConnection> = RecordingConnection::new();
        let handle = registry.register(&connection);

        assert!(handle.get().is_some());
        handle
            .write(1, Outbound::ChunkSize(4096))
            .unwrap();

        drop(connection);
        assert!(handle.get().is_none());
        // Writes to a vanished connection are silently dropped
        assert!(handle.write(1, Outbound::ChunkSize(4096)).is_ok());
        assert_eq!(handle.pending_messages(), 0);
    }

    #[test]
    fn test_unregister() {
        let registry = ConnectionRegistry::new();
        let connection: Arc<dyn StreamConnection> = RecordingConnection::new();
        let handle = registry.register(&connection);
        assert_eq!(registry.len(), 1);

        registry.unregister(handle.id());
        assert!(registry.is_empty());
        assert!(handle.get().is_none());
    }
}
