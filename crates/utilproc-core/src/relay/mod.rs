//! Backpressure relay between a worker's output pipe and its reader.

mod state;
mod stream;

pub use state::{Downstream, RelayCore, Resumes};
pub use stream::{OutputStream, ReadOutcome, Relay};
