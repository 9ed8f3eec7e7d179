//! Video frame dropping for live subscribers
//!
//! When a subscriber cannot keep up, frames are dropped in order of
//! increasing importance: disposable inter frames first, then everything up
//! to the next keyframe. Recovery happens one step at a time and only while
//! the connection has no video queued.
//!
//! ```text
//!   SendAll ──drop inter/key──► SendKeyframes
//!   SendKeyframes ──key sent, 0 pending──► SendKeyframesCheck
//!   SendKeyframesCheck ──key sent, 0 pending──► SendInterframes
//!   SendKeyframesCheck ──drop key──► SendKeyframes
//!   SendInterframes ──key sent, 0 pending──► SendAll
//!   SendInterframes ──drop inter──► SendKeyframesCheck
//!   SendInterframes ──drop key──► SendKeyframes
//! ```

use crate::media::flv::VideoFrameType;
use crate::messaging::RtmpEvent;

/// Which video frames may currently be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropperState {
    SendAll,
    /// Keyframes and inter frames, no disposable frames
    SendInterframes,
    /// Keyframes only; the next keyframe sent with nothing pending moves on
    /// to `SendInterframes`
    SendKeyframesCheck,
    /// Keyframes only
    SendKeyframes,
}

#[derive(Debug)]
pub struct VideoFrameDropper {
    state: DropperState,
}

impl Default for VideoFrameDropper {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoFrameDropper {
    pub fn new() -> Self {
        Self {
            state: DropperState::SendAll,
        }
    }

    pub fn state(&self) -> DropperState {
        self.state
    }

    /// Whether `event` may be sent with `pending` video messages queued
    ///
    /// Non-video events always pass.
    pub fn can_send_packet(&mut self, event: &RtmpEvent, pending: u64) -> bool {
        if !event.is_video() {
            return true;
        }
        let frame = event.video_frame_type();
        let keyframe = frame.map(|f| f.is_keyframe()).unwrap_or(false);

        match self.state {
            DropperState::SendAll => true,
            DropperState::SendInterframes => {
                if keyframe {
                    if pending == 0 {
                        self.state = DropperState::SendAll;
                    }
                    true
                } else {
                    frame == Some(VideoFrameType::InterFrame)
                }
            }
            DropperState::SendKeyframes => {
                if keyframe && pending == 0 {
                    self.state = DropperState::SendKeyframesCheck;
                }
                keyframe
            }
            DropperState::SendKeyframesCheck => {
                if keyframe && pending == 0 {
                    self.state = DropperState::SendInterframes;
                }
                keyframe
            }
        }
    }

    /// Record that `event` was dropped
    pub fn drop_packet(&mut self, event: &RtmpEvent) {
        if !event.is_video() {
            return;
        }
        let frame = event.video_frame_type();
        let keyframe = frame.map(|f| f.is_keyframe()).unwrap_or(false);
        let inter = frame == Some(VideoFrameType::InterFrame);

        let next = match self.state {
            DropperState::SendAll if keyframe || inter => DropperState::SendKeyframes,
            DropperState::SendInterframes if inter => DropperState::SendKeyframesCheck,
            DropperState::SendInterframes if keyframe => DropperState::SendKeyframes,
            DropperState::SendKeyframesCheck if keyframe => DropperState::SendKeyframes,
            state => state,
        };
        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, "Frame dropper state change");
            self.state = next;
        }
    }

    /// Record that `event` was sent
    pub fn send_packet(&mut self, _event: &RtmpEvent) {}

    /// Force a state
    pub fn reset(&mut self, state: DropperState) {
        self.state = state;
    }
}
