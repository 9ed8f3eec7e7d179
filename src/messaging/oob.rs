//! Out-of-band control messages
//!
//! An OOB message travels from one side of a pipe to every endpoint on the
//! other side. Endpoints ignore targets they do not serve; the sender reads
//! the result slot synchronously once the call returns.

/// Endpoint role an OOB message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobTarget {
    /// The consumer writing to the client connection
    ConnectionConsumer,
    /// Passive providers that accept an initial start position
    Passive,
    /// Providers that can seek
    SeekableProvider,
    /// Providers that know which tracks they carry
    StreamTypeAwareProvider,
}

/// Requested service and its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobService {
    /// Total messages queued on the connection
    PendingCount,
    /// Video messages queued for a stream
    PendingVideoCount,
    /// Bytes in flight and the bytes-read report interval
    WriteDelta,
    /// Announce a new outgoing chunk size
    ChunkSize(u32),
    /// Set the start position before the first pull
    Init { start_ts: i64 },
    /// Seek to a position, result is the position actually reached
    Seek { position: i64 },
    /// Whether the source carries video
    HasVideo,
}

/// Value written back by the endpoint that served the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobResult {
    Count(u64),
    Position(i64),
    Flag(bool),
    WriteDelta { in_flight: u64, report_interval: u64 },
}

/// Out-of-band control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobControlMessage {
    pub target: OobTarget,
    pub service: OobService,
    pub result: Option<OobResult>,
}

impl OobControlMessage {
    pub fn new(target: OobTarget, service: OobService) -> Self {
        Self {
            target,
            service,
            result: None,
        }
    }

    /// Result as a count, if one was written
    pub fn count(&self) -> Option<u64> {
        match self.result {
            Some(OobResult::Count(n)) => Some(n),
            _ => None,
        }
    }

    /// Result as a position, if one was written
    pub fn position(&self) -> Option<i64> {
        match self.result {
            Some(OobResult::Position(p)) => Some(p),
            _ => None,
        }
    }

    /// Result as a flag, if one was written
    pub fn flag(&self) -> Option<bool> {
        match self.result {
            Some(OobResult::Flag(b)) => Some(b),
            _ => None,
        }
    }
}
