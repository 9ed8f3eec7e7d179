//! Video codec state cached by live streams
//!
//! A live stream remembers just enough of its video to let a late subscriber
//! start decoding: the last keyframe and, for AVC, the decoder configuration
//! record. Payloads are never decoded.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::flv::{VideoCodec, VideoFrameType};

/// Codec-specific keyframe cache
pub trait VideoStreamCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether inter frames may be dropped under backpressure
    fn can_drop_frames(&self) -> bool;

    /// Whether the codec id in the header byte matches
    fn can_handle_data(&self, data: &Bytes) -> bool;

    /// Feed one video payload; returns `false` for data of another codec
    fn add_data(&mut self, data: &Bytes) -> bool;

    /// Last cached keyframe
    fn keyframe(&self) -> Option<Bytes>;

    /// Decoder configuration to send before the first frame
    fn decoder_configuration(&self) -> Option<Bytes>;

    fn reset(&mut self);
}

fn codec_of(data: &Bytes) -> Option<VideoCodec> {
    data.first().and_then(|&b| VideoCodec::from_byte(b))
}

fn is_keyframe(data: &Bytes) -> bool {
    data.first()
        .and_then(|&b| VideoFrameType::from_byte(b))
        .map(|ft| ft == VideoFrameType::Keyframe)
        .unwrap_or(false)
}

/// H.264 in FLV
#[derive(Debug, Default)]
pub struct AvcVideo {
    keyframe: Option<Bytes>,
    decoder_config: Option<Bytes>,
}

impl AvcVideo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoStreamCodec for AvcVideo {
    fn name(&self) -> &'static str {
        "AVC"
    }

    fn can_drop_frames(&self) -> bool {
        true
    }

    fn can_handle_data(&self, data: &Bytes) -> bool {
        codec_of(data) == Some(VideoCodec::Avc)
    }

    fn add_data(&mut self, data: &Bytes) -> bool {
        if !self.can_handle_data(data) {
            return false;
        }
        if !is_keyframe(data) {
            return true;
        }
        // Packet type 0 is the sequence header; only the first one is kept
        if data.get(1) == Some(&0) && self.decoder_config.is_none() {
            self.decoder_config = Some(data.clone());
        }
        self.keyframe = Some(data.clone());
        true
    }

    fn keyframe(&self) -> Option<Bytes> {
        self.keyframe.clone()
    }

    fn decoder_configuration(&self) -> Option<Bytes> {
        self.decoder_config.clone()
    }

    fn reset(&mut self) {
        self.keyframe = None;
        self.decoder_config = None;
    }
}

/// Sorenson H.263
#[derive(Debug, Default)]
pub struct SorensonVideo {
    keyframe: Option<Bytes>,
}

impl SorensonVideo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoStreamCodec for SorensonVideo {
    fn name(&self) -> &'static str {
        "SorensonVideo"
    }

    fn can_drop_frames(&self) -> bool {
        true
    }

    fn can_handle_data(&self, data: &Bytes) -> bool {
        codec_of(data) == Some(VideoCodec::SorensonH263)
    }

    fn add_data(&mut self, data: &Bytes) -> bool {
        if !self.can_handle_data(data) {
            return false;
        }
        if is_keyframe(data) {
            self.keyframe = Some(data.clone());
        }
        true
    }

    fn keyframe(&self) -> Option<Bytes> {
        self.keyframe.clone()
    }

    fn decoder_configuration(&self) -> Option<Bytes> {
        None
    }

    fn reset(&mut self) {
        self.keyframe = None;
    }
}

/// Screen video
///
/// Every frame only carries the blocks that changed, so no frame can be
/// dropped. The last keyframe is cached whole.
#[derive(Debug, Default)]
pub struct ScreenVideo {
    keyframe: Option<Bytes>,
}

impl ScreenVideo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoStreamCodec for ScreenVideo {
    fn name(&self) -> &'static str {
        "ScreenVideo"
    }

    fn can_drop_frames(&self) -> bool {
        false
    }

    fn can_handle_data(&self, data: &Bytes) -> bool {
        codec_of(data) == Some(VideoCodec::ScreenVideo)
    }

    fn add_data(&mut self, data: &Bytes) -> bool {
        if !self.can_handle_data(data) {
            return false;
        }
        if is_keyframe(data) {
            self.keyframe = Some(data.clone());
        }
        true
    }

    fn keyframe(&self) -> Option<Bytes> {
        self.keyframe.clone()
    }

    fn decoder_configuration(&self) -> Option<Bytes> {
        None
    }

    fn reset(&mut self) {
        self.keyframe = None;
    }
}

/// Picks a codec handler from the first video payload
#[derive(Debug, Default, Clone, Copy)]
pub struct VideoCodecFactory;

impl VideoCodecFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn video_codec(&self, data: &Bytes) -> Option<Box<dyn VideoStreamCodec>> {
        let codec: Box<dyn VideoStreamCodec> = match codec_of(data)? {
            VideoCodec::Avc => Box::new(AvcVideo::new()),
            VideoCodec::SorensonH263 => Box::new(SorensonVideo::new()),
            VideoCodec::ScreenVideo => Box::new(ScreenVideo::new()),
            other => {
                tracing::debug!(codec = ?other, "No handler for video codec");
                return None;
            }
        };
        Some(codec)
    }
}

/// Codec facts of one live stream, shared by the publisher and its scope
#[derive(Default)]
pub struct StreamCodecInfo {
    inner: RwLock<CodecInfoInner>,
}

#[derive(Default)]
struct CodecInfoInner {
    has_audio: bool,
    has_video: bool,
    video_codec: Option<Box<dyn VideoStreamCodec>>,
}

impl StreamCodecInfo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn has_audio(&self) -> bool {
        self.inner.read().has_audio
    }

    pub fn set_has_audio(&self, value: bool) {
        self.inner.write().has_audio = value;
    }

    pub fn has_video(&self) -> bool {
        self.inner.read().has_video
    }

    pub fn set_has_video(&self, value: bool) {
        self.inner.write().has_video = value;
    }

    pub fn video_codec_name(&self) -> Option<&'static str> {
        self.inner.read().video_codec.as_ref().map(|c| c.name())
    }

    pub fn has_video_codec(&self) -> bool {
        self.inner.read().video_codec.is_some()
    }

    pub fn set_video_codec(&self, codec: Box<dyn VideoStreamCodec>) {
        self.inner.write().video_codec = Some(codec);
    }

    /// Feed a video payload to the selected codec
    pub fn add_video_data(&self, data: &Bytes) {
        if let Some(codec) = self.inner.write().video_codec.as_mut() {
            codec.add_data(data);
        }
    }

    pub fn can_drop_frames(&self) -> bool {
        self.inner
            .read()
            .video_codec
            .as_ref()
            .map(|c| c.can_drop_frames())
            .unwrap_or(true)
    }

    /// Cached decoder configuration and keyframe, in sending order
    pub fn start_frames(&self) -> (Option<Bytes>, Option<Bytes>) {
        let inner = self.inner.read();
        match inner.video_codec.as_ref() {
            Some(codec) => (codec.decoder_configuration(), codec.keyframe()),
            None => (None, None),
        }
    }
}
