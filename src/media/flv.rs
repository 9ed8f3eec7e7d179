//! FLV tags as stored in VOD files and recordings
//!
//! Only the first body byte of a video tag matters to delivery: frame type in
//! the upper nibble, codec id in the lower one.
//! ```text
//! +-----------+----------+
//! | FrameType | CodecID  | CodecData...
//! | (4 bits)  | (4 bits) |
//! +-----------+----------+
//! ```

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    /// Metadata such as `onMetaData`
    Script,
}

/// Tag of a streamable file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    /// Milliseconds from the start of the file
    pub timestamp: u32,
    /// Body including the codec header byte
    pub data: Bytes,
}

/// Video frame type, in order of decreasing importance to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    /// Frame type from a video header byte
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b >> 4 {
            1 => VideoFrameType::Keyframe,
            2 => VideoFrameType::InterFrame,
            3 => VideoFrameType::DisposableInterFrame,
            4 => VideoFrameType::GeneratedKeyframe,
            5 => VideoFrameType::VideoInfoFrame,
            _ => return None,
        })
    }

    pub fn is_keyframe(self) -> bool {
        matches!(self, VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe)
    }
}

/// Video codec ids the delivery engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    Avc = 7,
}

impl VideoCodec {
    /// Codec from a video header byte
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b & 0x0F {
            2 => VideoCodec::SorensonH263,
            3 => VideoCodec::ScreenVideo,
            4 => VideoCodec::Vp6,
            5 => VideoCodec::Vp6Alpha,
            6 => VideoCodec::ScreenVideoV2,
            7 => VideoCodec::Avc,
            _ => return None,
        })
    }
}

impl FlvTag {
    pub fn new(tag_type: FlvTagType, timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type,
            timestamp,
            data,
        }
    }

    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self::new(FlvTagType::Video, timestamp, data)
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self::new(FlvTagType::Audio, timestamp, data)
    }

    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    /// Seek points of a file are its video keyframes
    pub fn is_keyframe(&self) -> bool {
        self.is_video()
            && self
                .data
                .first()
                .and_then(|&b| VideoFrameType::from_byte(b))
                .map_or(false, VideoFrameType::is_keyframe)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_nibbles() {
        // keyframe + AVC
        assert_eq!(VideoFrameType::from_byte(0x17), Some(VideoFrameType::Keyframe));
        assert_eq!(VideoCodec::from_byte(0x17), Some(VideoCodec::Avc));

        // disposable inter frame + Sorenson
        assert_eq!(
            VideoFrameType::from_byte(0x32),
            Some(VideoFrameType::DisposableInterFrame)
        );
        assert_eq!(VideoCodec::from_byte(0x32), Some(VideoCodec::SorensonH263));

        assert_eq!(VideoFrameType::from_byte(0x60), None);
        assert_eq!(VideoCodec::from_byte(0x1F), None);
    }

    #[test]
    fn test_keyframe_tags() {
        assert!(FlvTag::video(0, Bytes::from_static(&[0x12])).is_keyframe());
        assert!(FlvTag::video(0, Bytes::from_static(&[0x47])).is_keyframe());
        assert!(!FlvTag::video(0, Bytes::from_static(&[0x22])).is_keyframe());
        assert!(!FlvTag::video(0, Bytes::new()).is_keyframe());
        // Audio bodies are never seek points, whatever their first byte
        assert!(!FlvTag::audio(0, Bytes::from_static(&[0x17])).is_keyframe());
    }
}
