//! Pipe consumer writing to a client connection

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::messaging::{
    Consumer, EndpointId, MessageComponent, OobControlMessage, OobResult, OobService, OobTarget,
    Pipe, PipeMessage,
};

use super::{ConnectionHandle, Outbound};

/// Acknowledgement window assumed for write-delta reports
const DEFAULT_WINDOW: u64 = 120 * 1024;

const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Last consumer in the delivery chain of one client stream
pub struct ConnectionConsumer {
    id: EndpointId,
    connection: ConnectionHandle,
    stream_id: u32,
    chunk_size: AtomicU32,
    chunk_size_sent: AtomicBool,
}

impl ConnectionConsumer {
    pub fn new(connection: ConnectionHandle, stream_id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: EndpointId::next(),
            connection,
            stream_id,
            chunk_size: AtomicU32::new(DEFAULT_CHUNK_SIZE),
            chunk_size_sent: AtomicBool::new(false),
        })
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    fn send_chunk_size(&self) -> Result<()> {
        self.chunk_size_sent.store(true, Ordering::Release);
        let size = self.chunk_size.load(Ordering::Acquire);
        self.connection.write(self.stream_id, Outbound::ChunkSize(size))
    }
}

impl MessageComponent for ConnectionConsumer {
    fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    fn on_oob_control_message(&self, _pipe: &Pipe, msg: &mut OobControlMessage) {
        if msg.target != OobTarget::ConnectionConsumer {
            return;
        }
        match msg.service {
            OobService::PendingCount => {
                msg.result = Some(OobResult::Count(self.connection.pending_messages()));
            }
            OobService::PendingVideoCount => {
                let count = self.connection.pending_video_messages(self.stream_id);
                msg.result = Some(OobResult::Count(count));
            }
            OobService::WriteDelta => {
                let (written, read) = self
                    .connection
                    .get()
                    .map(|c| (c.written_bytes(), c.client_bytes_read()))
                    .unwrap_or((0, 0));
                msg.result = Some(OobResult::WriteDelta {
                    in_flight: written.saturating_sub(read),
                    report_interval: DEFAULT_WINDOW / 2,
                });
            }
            OobService::ChunkSize(size) => {
                let previous = self.chunk_size.swap(size, Ordering::AcqRel);
                if previous != size || !self.chunk_size_sent.load(Ordering::Acquire) {
                    if let Err(e) = self.send_chunk_size() {
                        tracing::warn!(stream_id = self.stream_id, error = %e, "Failed to send chunk size");
                    }
                }
            }
            _ => {}
        }
    }
}

impl Consumer for ConnectionConsumer {
    fn push_message(&self, _pipe: &Pipe, message: &PipeMessage) -> Result<()> {
        match message {
            PipeMessage::Reset => Ok(()),
            PipeMessage::Status(status) => self
                .connection
                .write(self.stream_id, Outbound::Status(status.clone())),
            PipeMessage::Rtmp(event) => {
                if event.timestamp < 0 {
                    tracing::trace!(stream_id = self.stream_id, timestamp = event.timestamp, "Skipping event with negative timestamp");
                    return Ok(());
                }
                if !self.chunk_size_sent.load(Ordering::Acquire) {
                    self.send_chunk_size()?;
                }
                self.connection
                    .write(self.stream_id, Outbound::Event(event.clone()))
            }
        }
    }
}

/// Creates the output pipes of client streams
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumerService;

impl ConsumerService {
    pub fn new() -> Self {
        Self
    }

    /// Push pipe delivering to `stream_id` on the connection
    pub fn consumer_output(&self, connection: &ConnectionHandle, stream_id: u32) -> Arc<Pipe> {
        let pipe = Arc::new(Pipe::push_push());
        pipe.subscribe_consumer(ConnectionConsumer::new(connection.clone(), stream_id));
        pipe
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::connection::{ConnectionRegistry, StreamConnection};
    use crate::messaging::{RtmpEvent, Status, StatusCode};
    use crate::testing::RecordingConnection;

    fn output() -> (Arc<RecordingConnection>, Arc<Pipe>) {
        let registry = ConnectionRegistry::new();
        let connection = RecordingConnection::new();
        let dyn_connection: Arc<dyn StreamConnection> = connection.clone();
        let handle = registry.register(&dyn_connection);
        (connection, ConsumerService::new().consumer_output(&handle, 1))
    }

    #[test]
    fn test_chunk_size_precedes_first_event() {
        let (connection, pipe) = output();
        pipe.push_message(&RtmpEvent::audio(0, Bytes::new()).into()).unwrap();
        pipe.push_message(&RtmpEvent::audio(20, Bytes::new()).into()).unwrap();

        let written = connection.outbound(1);
        assert_eq!(written.len(), 3);
        assert_eq!(written[0], Outbound::ChunkSize(DEFAULT_CHUNK_SIZE));
        assert!(matches!(written[1], Outbound::Event(_)));
    }

    #[test]
    fn test_negative_timestamps_skipped() {
        let (connection, pipe) = output();
        pipe.push_message(&RtmpEvent::blank_audio(-10).into()).unwrap();
        assert!(connection.outbound(1).is_empty());
    }

    #[test]
    fn test_status_written() {
        let (connection, pipe) = output();
        pipe.push_message(&Status::new(StatusCode::PlayStart, 1).into())
            .unwrap();
        assert_eq!(connection.statuses(1), vec![StatusCode::PlayStart]);
    }

    #[test]
    fn test_oob_queries() {
        let (connection, pipe) = output();
        connection.set_pending(7, 3);

        let mut pending = OobControlMessage::new(OobTarget::ConnectionConsumer, OobService::PendingCount);
        pipe.send_oob_to_consumers(&mut pending);
        assert_eq!(pending.count(), Some(7));

        let mut video = OobControlMessage::new(OobTarget::ConnectionConsumer, OobService::PendingVideoCount);
        pipe.send_oob_to_consumers(&mut video);
        assert_eq!(video.count(), Some(3));

        let mut delta = OobControlMessage::new(OobTarget::ConnectionConsumer, OobService::WriteDelta);
        pipe.send_oob_to_consumers(&mut delta);
        assert_eq!(
            delta.result,
            Some(OobResult::WriteDelta {
                in_flight: 0,
                report_interval: 60 * 1024
            })
        );

        let mut chunk = OobControlMessage::new(OobTarget::ConnectionConsumer, OobService::ChunkSize(4096));
        pipe.send_oob_to_consumers(&mut chunk);
        assert_eq!(connection.outbound(1), vec![Outbound::ChunkSize(4096)]);
    }
}
