//! Errors from the native process host.

use utilproc_core::Error;

/// Failures while bringing up a worker process.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind message channel: {0}")]
    ChannelBind(#[source] std::io::Error),

    #[error("Failed to capture {0} of the worker")]
    MissingPipe(&'static str),

    #[error("No tokio runtime available to drive the worker")]
    NoRuntime,
}

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        Self::LaunchFailure(err.to_string())
    }
}
