//! Events flowing out of a worker.
//!
//! [`HostEvent`] is what a process host emits on its single event channel.
//! [`WorkerEvent`] is what observers of a [`UtilityProcess`](crate::UtilityProcess)
//! see: stdout/stderr data never shows up there, it is consumed into the
//! output streams.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STDOUT_TAG: &str = "stdout";
pub const STDERR_TAG: &str = "stderr";
pub const EXIT_TAG: &str = "exit";

/// One item of an output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    /// No more data will follow.
    End,
}

impl Chunk {
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self::Data(bytes.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Data(bytes) => bytes.len(),
            Self::End => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tells the upstream it may produce the next chunk.
pub type ResumeCallback = Box<dyn FnOnce() + Send>;

/// Payload of a stdout/stderr event.
pub struct StreamData {
    pub chunk: Chunk,
    pub resume: Option<ResumeCallback>,
}

impl StreamData {
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            resume: None,
        }
    }

    pub fn with_resume(chunk: Chunk, resume: impl FnOnce() + Send + 'static) -> Self {
        Self {
            chunk,
            resume: Some(Box::new(resume)),
        }
    }
}

impl fmt::Debug for StreamData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamData")
            .field("chunk", &self.chunk)
            .field("resume", &self.resume.is_some())
            .finish()
    }
}

/// How the worker ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    /// Exit code, absent when the worker was killed by a signal.
    pub code: Option<i32>,
    /// Terminating signal (unix only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub const fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub const fn with_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Event emitted by a process host, in emission order.
#[derive(Debug)]
pub enum HostEvent {
    Stdout(StreamData),
    Stderr(StreamData),
    /// Terminal event. No stream data follows it.
    Exit(ExitInfo),
    /// Anything else, forwarded verbatim to observers.
    Other { tag: String, payload: Value },
}

impl HostEvent {
    pub fn other(tag: impl Into<String>, payload: Value) -> Self {
        Self::Other {
            tag: tag.into(),
            payload,
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Stdout(_) => STDOUT_TAG,
            Self::Stderr(_) => STDERR_TAG,
            Self::Exit(_) => EXIT_TAG,
            Self::Other { tag, .. } => tag,
        }
    }
}

/// Public notification delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    Exit(ExitInfo),
    Other { tag: String, payload: Value },
}

impl WorkerEvent {
    pub fn tag(&self) -> &str {
        match self {
            Self::Exit(_) => EXIT_TAG,
            Self::Other { tag, .. } => tag,
        }
    }
}
