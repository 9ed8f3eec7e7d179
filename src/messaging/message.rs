//! Messages carried by pipes
//!
//! Media payloads are `bytes::Bytes`, so pushing the same event to many
//! consumers only bumps a reference count.

use bytes::Bytes;

use crate::media::flv::{FlvTag, FlvTagType, VideoFrameType};

use super::status::Status;

/// Ping (user control) kinds emitted by the delivery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    /// Stream begins playing
    StreamBegin,
    /// Client should drop whatever it has buffered
    StreamPlayBufferClear,
    /// Stream is recorded (VOD) rather than live
    RecordedStream,
}

/// Ping event addressed to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub kind: PingKind,
    pub stream_id: u32,
}

/// `onPlayStatus` notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayStatus {
    pub code: &'static str,
    pub duration: i64,
    pub bytes: u64,
}

/// Event body
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    Audio(Bytes),
    Video(Bytes),
    /// Data message such as `onMetaData`
    Notify(Bytes),
    Invoke(Bytes),
    PlayStatus(PlayStatus),
    Ping(Ping),
}

/// RTMP-level event with its timestamp in milliseconds
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpEvent {
    pub body: EventBody,
    pub timestamp: i64,
    /// Timestamp is a delta against the previous event of the same channel
    pub relative: bool,
}

impl RtmpEvent {
    pub fn new(body: EventBody, timestamp: i64) -> Self {
        Self {
            body,
            timestamp,
            relative: false,
        }
    }

    pub fn audio(timestamp: i64, data: Bytes) -> Self {
        Self::new(EventBody::Audio(data), timestamp)
    }

    pub fn video(timestamp: i64, data: Bytes) -> Self {
        Self::new(EventBody::Video(data), timestamp)
    }

    pub fn notify(timestamp: i64, data: Bytes) -> Self {
        Self::new(EventBody::Notify(data), timestamp)
    }

    pub fn ping(kind: PingKind, stream_id: u32) -> Self {
        Self::new(EventBody::Ping(Ping { kind, stream_id }), 0)
    }

    /// Audio frame without payload, used to realign the client timeline
    pub fn blank_audio(timestamp: i64) -> Self {
        Self::audio(timestamp, Bytes::new())
    }

    /// Mark the timestamp as relative
    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.body, EventBody::Audio(_))
    }

    pub fn is_video(&self) -> bool {
        matches!(self.body, EventBody::Video(_))
    }

    /// Payload for media and data events
    pub fn data(&self) -> Option<&Bytes> {
        match &self.body {
            EventBody::Audio(data)
            | EventBody::Video(data)
            | EventBody::Notify(data)
            | EventBody::Invoke(data) => Some(data),
            _ => None,
        }
    }

    /// Payload size in bytes, used for token accounting
    pub fn size(&self) -> usize {
        self.data().map(Bytes::len).unwrap_or(0)
    }

    /// Frame type of a video event
    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        match &self.body {
            EventBody::Video(data) if !data.is_empty() => VideoFrameType::from_byte(data[0]),
            _ => None,
        }
    }

    /// Whether this is a video keyframe
    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type()
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false)
    }

    /// Convert a stored FLV tag
    pub fn from_flv_tag(tag: &FlvTag) -> Self {
        let timestamp = i64::from(tag.timestamp);
        match tag.tag_type {
            FlvTagType::Audio => Self::audio(timestamp, tag.data.clone()),
            FlvTagType::Video => Self::video(timestamp, tag.data.clone()),
            FlvTagType::Script => Self::notify(timestamp, tag.data.clone()),
        }
    }

    /// Convert back into an FLV tag for recording
    ///
    /// Only media and data events have a tag representation.
    pub fn to_flv_tag(&self) -> Option<FlvTag> {
        let timestamp = u32::try_from(self.timestamp.max(0)).unwrap_or(u32::MAX);
        let (tag_type, data) = match &self.body {
            EventBody::Audio(data) => (FlvTagType::Audio, data.clone()),
            EventBody::Video(data) => (FlvTagType::Video, data.clone()),
            EventBody::Notify(data) => (FlvTagType::Script, data.clone()),
            _ => return None,
        };
        Some(FlvTag {
            tag_type,
            timestamp,
            data,
        })
    }
}

/// Message travelling through a pipe
#[derive(Debug, Clone, PartialEq)]
pub enum PipeMessage {
    Rtmp(RtmpEvent),
    Status(Status),
    /// Consumers reset their timestamp bookkeeping
    Reset,
}

impl From<RtmpEvent> for PipeMessage {
    fn from(event: RtmpEvent) -> Self {
        PipeMessage::Rtmp(event)
    }
}

impl From<Status> for PipeMessage {
    fn from(status: Status) -> Self {
        PipeMessage::Status(status)
    }
}
