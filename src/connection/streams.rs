//! Streams owned by one connection
//!
//! A client first reserves a stream id (`createStream`) and later turns it
//! into a play or publish stream. Ids are handed out lowest-free first,
//! starting at 1.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::stream::{ClientBroadcastStream, PlaylistSubscriberStream};

/// A stream a client created on its connection
#[derive(Clone)]
pub enum ClientStream {
    Subscriber(Arc<PlaylistSubscriberStream>),
    Broadcast(Arc<ClientBroadcastStream>),
}

impl ClientStream {
    pub fn stream_id(&self) -> u32 {
        match self {
            ClientStream::Subscriber(s) => s.stream_id(),
            ClientStream::Broadcast(s) => s.stream_id(),
        }
    }

    pub fn close(&self) {
        match self {
            ClientStream::Subscriber(s) => s.close(),
            ClientStream::Broadcast(s) => s.close(),
        }
    }

    pub fn as_subscriber(&self) -> Option<&Arc<PlaylistSubscriberStream>> {
        match self {
            ClientStream::Subscriber(s) => Some(s),
            ClientStream::Broadcast(_) => None,
        }
    }

    pub fn as_broadcast(&self) -> Option<&Arc<ClientBroadcastStream>> {
        match self {
            ClientStream::Broadcast(s) => Some(s),
            ClientStream::Subscriber(_) => None,
        }
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ClientStream::Subscriber(_) => "Subscriber",
            ClientStream::Broadcast(_) => "Broadcast",
        };
        f.debug_struct("ClientStream")
            .field("kind", &kind)
            .field("stream_id", &self.stream_id())
            .finish()
    }
}

/// Stream table of one connection
#[derive(Default)]
pub struct ConnectionStreams {
    reserved: Mutex<BTreeSet<u32>>,
    streams: DashMap<u32, ClientStream>,
}

impl ConnectionStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest free stream id
    pub fn reserve(&self) -> u32 {
        let mut reserved = self.reserved.lock();
        let mut id = 1;
        while reserved.contains(&id) {
            id += 1;
        }
        reserved.insert(id);
        id
    }

    pub fn is_reserved(&self, stream_id: u32) -> bool {
        self.reserved.lock().contains(&stream_id)
    }

    /// Release an id; its stream, if any, is dropped from the table
    pub fn unreserve(&self, stream_id: u32) {
        self.streams.remove(&stream_id);
        self.reserved.lock().remove(&stream_id);
    }

    pub fn get(&self, stream_id: u32) -> Option<ClientStream> {
        self.streams.get(&stream_id).map(|s| s.value().clone())
    }

    /// Store a stream under its id, reserving the id if needed
    pub fn insert(&self, stream: ClientStream) {
        let id = stream.stream_id();
        self.reserved.lock().insert(id);
        self.streams.insert(id, stream);
    }

    /// Take a stream out of the table; the id stays reserved
    pub fn remove(&self, stream_id: u32) -> Option<ClientStream> {
        self.streams.remove(&stream_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Close every stream and release every id
    pub fn close_all(&self) {
        let ids: Vec<u32> = self.streams.iter().map(|s| *s.key()).collect();
        for id in ids {
            if let Some(stream) = self.remove(id) {
                stream.close();
            }
        }
        self.reserved.lock().clear();
    }
}

impl std::fmt::Debug for ConnectionStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStreams")
            .field("reserved", &*self.reserved.lock())
            .field("streams", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;
    use crate::testing::Fixture;

    #[test]
    fn test_reserve_lowest_free() {
        let streams = ConnectionStreams::new();
        assert_eq!(streams.reserve(), 1);
        assert_eq!(streams.reserve(), 2);
        assert_eq!(streams.reserve(), 3);

        streams.unreserve(2);
        assert!(!streams.is_reserved(2));
        assert_eq!(streams.reserve(), 2);
        assert_eq!(streams.reserve(), 4);
    }

    #[test]
    fn test_insert_and_lookup() {
        let fixture = Fixture::new();
        let streams = ConnectionStreams::new();
        let subscriber = fixture.subscriber(3);
        streams.insert(ClientStream::Subscriber(subscriber));

        assert!(streams.is_reserved(3));
        assert_eq!(streams.reserve(), 1);
        let stream = streams.get(3).unwrap();
        assert_eq!(stream.stream_id(), 3);
        assert!(stream.as_subscriber().is_some());
        assert!(stream.as_broadcast().is_none());

        assert!(streams.remove(3).is_some());
        assert!(streams.get(3).is_none());
        assert!(streams.is_reserved(3));
    }

    #[test]
    fn test_close_all() {
        let fixture = Fixture::new();
        let streams = ConnectionStreams::new();
        let subscriber = fixture.subscriber(1);
        let publisher = fixture.publisher(2, "cam1");
        streams.insert(ClientStream::Subscriber(subscriber.clone()));
        streams.insert(ClientStream::Broadcast(publisher.clone()));

        streams.close_all();
        assert!(streams.is_empty());
        assert!(!streams.is_reserved(1));
        assert_eq!(subscriber.state(), StreamState::Closed);
        assert!(publisher.is_closed());
        assert_eq!(fixture.providers().scope_count(), 0);
    }
}
