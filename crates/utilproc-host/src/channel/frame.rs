//! Wire format of the worker message channel.
//!
//! One JSON object per line, discriminated by `kind`. Readers are tolerant:
//! unknown kinds parse as [`Frame::Unknown`] and are skipped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utilproc_core::PortId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Structured message. `ports` lists ports transferred along with it.
    Message {
        data: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ports: Vec<PortId>,
    },
    /// Message on a transferred port.
    PortMessage { port: PortId, data: Value },
    /// The sending side closed its end of a transferred port.
    PortClose { port: PortId },
    /// Custom worker event, surfaced to observers under `tag`.
    Event {
        tag: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Parse one line read from the channel.
pub fn parse_frame(line: &str) -> serde_json::Result<Frame> {
    serde_json::from_str(line)
}

/// Encode a frame as one newline-terminated line.
pub fn encode_frame(frame: &Frame) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}
