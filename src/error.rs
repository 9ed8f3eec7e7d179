//! Error types for the delivery engine
//!
//! Failures that the facade turns into NetStream status notifications are
//! modelled as variants here. Bandwidth shortfalls are never errors: token
//! acquisition reports them through its return value.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate error type
#[derive(Debug, Error)]
pub enum Error {
    /// Operation is not valid in the stream's current state
    #[error("illegal state: cannot {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },

    /// Requested stream name resolved to neither a live nor a VOD source
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Operation is not available for this kind of source
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// Stream name is already taken by another publisher
    #[error("bad stream name: {0}")]
    BadName(String),

    /// A stream was started without any play item
    #[error("no playlist items")]
    NoPlaylistItems,

    /// Stream has been closed
    #[error("stream closed")]
    Closed,

    /// I/O failure from a connection, file or recording sink
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an illegal-state error
    pub fn illegal_state(operation: &'static str, state: &'static str) -> Self {
        Error::IllegalState { operation, state }
    }

    /// Whether this error came from an I/O failure
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::StreamNotFound("cam1".into());
        assert_eq!(err.to_string(), "stream not found: cam1");

        let err = Error::IllegalState {
            operation: "pause",
            state: "stopped",
        };
        assert_eq!(err.to_string(), "illegal state: cannot pause while stopped");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io.into();
        assert!(err.is_io());
        assert!(!Error::Closed.is_io());
    }
}
