//! Error types for farcc.

use thiserror::Error;

/// Main error type for farcc.
#[derive(Error, Debug)]
pub enum FarccError {
    /// The temporary object-file path could not be allocated. This is the one
    /// failure that aborts a job before any classification exists.
    #[error("failed to allocate object file path: {0}")]
    Artifact(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure reported by the message-channel collaborator while
    /// receiving framed input.
    #[error("message channel error: {0}")]
    Channel(String),
}

/// Result type alias for farcc operations.
pub type Result<T> = std::result::Result<T, FarccError>;
