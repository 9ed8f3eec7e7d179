//! Media handling
//!
//! This module provides:
//! - FLV tags and the header-byte frame/codec fields
//! - Per-codec keyframe caches for live streams

pub mod codec;
pub mod flv;

pub use codec::{StreamCodecInfo, VideoCodecFactory, VideoStreamCodec};
pub use flv::{FlvTag, FlvTagType, VideoCodec, VideoFrameType};
