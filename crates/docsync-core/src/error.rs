//! Error types for docsync

use thiserror::Error;

/// Main error type for docsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Leading message tag does not name one of the known message kinds
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u64),

    /// Inbound bytes could not be decoded (truncated or corrupted frame)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Outbound message could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// Presence update carried an invalid state
    #[error("Presence error: {0}")]
    Presence(String),

    /// An operation needed a tokio runtime and none was running
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::UnknownMessageKind(99);
        assert_eq!(format!("{}", err), "Unknown message kind: 99");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }
}
