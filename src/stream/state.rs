//! Stream states and play items

/// Lifecycle state of a client stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not started
    Uninit,
    Stopped,
    Playing,
    Paused,
    /// Terminal
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Uninit => "uninit",
            StreamState::Stopped => "stopped",
            StreamState::Playing => "playing",
            StreamState::Paused => "paused",
            StreamState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start value asking for live, then VOD, then waiting for a publisher
pub const START_LIVE_OR_VOD: i64 = -2000;

/// Start value asking for live only
pub const START_LIVE: i64 = -1000;

/// One entry of a playlist
///
/// `start` and `length` are milliseconds. A negative `start` selects live
/// playback (see [`PlayItem::play_type`]); a negative `length` plays to the
/// end, zero sends a single video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayItem {
    pub name: String,
    pub start: i64,
    pub length: i64,
}

impl PlayItem {
    /// Item playing live if available, otherwise VOD, until the end
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: START_LIVE_OR_VOD,
            length: -1,
        }
    }

    /// Set the start position
    pub fn start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    /// Set the length
    pub fn length(mut self, length: i64) -> Self {
        self.length = length;
        self
    }

    /// Start in whole seconds: -2 live then VOD, -1 live only, >= 0 VOD
    pub fn play_type(&self) -> i64 {
        self.start / 1000
    }
}

/// Publishing mode requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Live,
    Record,
    Append,
}

impl PublishMode {
    /// Parse a mode name; unknown names publish live
    pub fn parse(mode: &str) -> Self {
        match mode {
            "record" => PublishMode::Record,
            "append" => PublishMode::Append,
            _ => PublishMode::Live,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_type() {
        assert_eq!(PlayItem::new("cam1").play_type(), -2);
        assert_eq!(PlayItem::new("cam1").start(START_LIVE).play_type(), -1);
        assert_eq!(PlayItem::new("clip").start(0).play_type(), 0);
        assert_eq!(PlayItem::new("clip").start(5000).play_type(), 5);
        // Sub-second offsets still select VOD
        assert_eq!(PlayItem::new("clip").start(500).play_type(), 0);
    }

    #[test]
    fn test_publish_mode() {
        assert_eq!(PublishMode::parse("record"), PublishMode::Record);
        assert_eq!(PublishMode::parse("append"), PublishMode::Append);
        assert_eq!(PublishMode::parse("live"), PublishMode::Live);
        assert_eq!(PublishMode::parse("unknown"), PublishMode::Live);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(StreamState::Playing.to_string(), "playing");
        assert_eq!(StreamState::Closed.as_str(), "closed");
    }
}
