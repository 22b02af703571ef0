//! Structured message channel between the host and a worker.

mod frame;
mod server;

pub use frame::{Frame, encode_frame, parse_frame};
pub use server::{ChannelHandle, ChannelServer, MESSAGE_TAG};
