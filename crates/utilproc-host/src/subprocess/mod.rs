//! Worker subprocess management on tokio.

pub mod manager;
mod pump;

pub use manager::{CHANNEL_ENV, SERVICE_NAME_ENV, SPAWN_TAG, TokioProcess, TokioProcessHost};
