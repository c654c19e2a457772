//! Error types for mount orchestration.

use thiserror::Error;

/// Errors raised while negotiating, mounting or releasing a remote filesystem.
#[derive(Error, Debug)]
pub enum MountError {
    /// The offer payload is malformed.
    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    /// The local mount point could not be prepared.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// The backend failed to establish access.
    #[error("Mount failed: {0}")]
    Mount(String),

    /// The backend failed to release access.
    #[error("Unmount failed: {0}")]
    Unmount(String),

    /// The client reported an unrecoverable secure-channel failure.
    #[error("{0}")]
    FatalBackendSignal(String),

    /// The session actor is no longer running.
    #[error("Session closed")]
    SessionClosed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or configuration could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for mount operations.
pub type Result<T> = std::result::Result<T, MountError>;
