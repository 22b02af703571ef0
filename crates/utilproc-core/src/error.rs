//! Error types for the utilproc core library.

use thiserror::Error;

/// Result type alias using the utilproc [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for utility process operations.
///
/// Calls made after the worker already exited (`send_message`, `terminate`)
/// are not errors; they report `false` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed constructor input. The process is never launched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The process host could not create the process.
    #[error("Failed to launch utility process: {0}")]
    LaunchFailure(String),

    /// An event observer failed. Reported after cleanup completed.
    #[error("Event observer failed: {0}")]
    Observer(String),

    /// Settings error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
