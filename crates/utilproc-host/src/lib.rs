//! utilproc Host Library
//!
//! Native process host for utility processes:
//! - Worker spawning and reaping on `tokio::process`
//! - Chunked stdout/stderr pumps that wait for the relay to ask for more
//! - Loopback NDJSON channel for structured messages and transferred ports

pub mod channel;
pub mod error;
pub mod subprocess;

pub use error::HostError;
pub use subprocess::TokioProcessHost;
