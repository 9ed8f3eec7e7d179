//! NetStream status notifications

/// Severity attached to a status notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Status,
    Warning,
    Error,
}

impl StatusLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLevel::Status => "status",
            StatusLevel::Warning => "warning",
            StatusLevel::Error => "error",
        }
    }
}

/// NetStream status codes emitted to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    PlayStart,
    PlayStop,
    PlayReset,
    PlayStreamNotFound,
    PlayPublishNotify,
    PlayUnpublishNotify,
    PlayInsufficientBw,
    PlayFailed,
    PlaySwitch,
    PlayComplete,
    SeekNotify,
    SeekFailed,
    PauseNotify,
    UnpauseNotify,
    PublishStart,
    PublishBadName,
    UnpublishSuccess,
    RecordStart,
    RecordStop,
    RecordFailed,
    RecordNoAccess,
    Failed,
}

impl StatusCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::PlayStart => "NetStream.Play.Start",
            StatusCode::PlayStop => "NetStream.Play.Stop",
            StatusCode::PlayReset => "NetStream.Play.Reset",
            StatusCode::PlayStreamNotFound => "NetStream.Play.StreamNotFound",
            StatusCode::PlayPublishNotify => "NetStream.Play.PublishNotify",
            StatusCode::PlayUnpublishNotify => "NetStream.Play.UnpublishNotify",
            StatusCode::PlayInsufficientBw => "NetStream.Play.InsufficientBW",
            StatusCode::PlayFailed => "NetStream.Play.Failed",
            StatusCode::PlaySwitch => "NetStream.Play.Switch",
            StatusCode::PlayComplete => "NetStream.Play.Complete",
            StatusCode::SeekNotify => "NetStream.Seek.Notify",
            StatusCode::SeekFailed => "NetStream.Seek.Failed",
            StatusCode::PauseNotify => "NetStream.Pause.Notify",
            StatusCode::UnpauseNotify => "NetStream.Unpause.Notify",
            StatusCode::PublishStart => "NetStream.Publish.Start",
            StatusCode::PublishBadName => "NetStream.Publish.BadName",
            StatusCode::UnpublishSuccess => "NetStream.Unpublish.Success",
            StatusCode::RecordStart => "NetStream.Record.Start",
            StatusCode::RecordStop => "NetStream.Record.Stop",
            StatusCode::RecordFailed => "NetStream.Record.Failed",
            StatusCode::RecordNoAccess => "NetStream.Record.NoAccess",
            StatusCode::Failed => "NetStream.Failed",
        }
    }

    /// Default level for the code
    pub fn level(&self) -> StatusLevel {
        match self {
            StatusCode::PlayStreamNotFound
            | StatusCode::PlayFailed
            | StatusCode::SeekFailed
            | StatusCode::PublishBadName
            | StatusCode::RecordFailed
            | StatusCode::RecordNoAccess
            | StatusCode::Failed => StatusLevel::Error,
            StatusCode::PlayInsufficientBw => StatusLevel::Warning,
            _ => StatusLevel::Status,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status notification addressed to one client stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub level: StatusLevel,
    /// Stream id the notification belongs to
    pub client_id: u32,
    /// Usually the stream or item name
    pub details: String,
    pub description: String,
}

impl Status {
    /// Create a status with the code's default level
    pub fn new(code: StatusCode, client_id: u32) -> Self {
        Self {
            code,
            level: code.level(),
            client_id,
            details: String::new(),
            description: String::new(),
        }
    }

    /// Set the details field
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Set the description field
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_levels() {
        assert_eq!(StatusCode::PlayStart.as_str(), "NetStream.Play.Start");
        assert_eq!(
            StatusCode::PlayInsufficientBw.as_str(),
            "NetStream.Play.InsufficientBW"
        );
        assert_eq!(StatusCode::PlayStart.level(), StatusLevel::Status);
        assert_eq!(StatusCode::PlayStreamNotFound.level(), StatusLevel::Error);
        assert_eq!(StatusCode::PlayInsufficientBw.level(), StatusLevel::Warning);
    }

    #[test]
    fn test_builder() {
        let status = Status::new(StatusCode::PlayReset, 3)
            .details("clip")
            .description("Playing and resetting clip.");

        assert_eq!(status.client_id, 3);
        assert_eq!(status.details, "clip");
        assert_eq!(status.level.as_str(), "status");
        assert_eq!(status.code.to_string(), "NetStream.Play.Reset");
    }
}
