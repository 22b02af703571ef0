//! `utilproc` Core Library
//!
//! Host-independent side of utility process management:
//! - Option validation and launch descriptors
//! - Event routing from a process host to the worker handle
//! - Flow-controlled stdout/stderr relays
//! - Message ports that can be transferred to a worker
//! - Configuration resolution and hierarchy

pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod multiplexer;
pub mod options;
pub mod ports;
pub mod process;
pub mod relay;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod tracing_init;

pub use config::{Config, LauncherConfig};
pub use error::{Error, Result};
pub use events::{Chunk, ExitInfo, HostEvent, StreamData, WorkerEvent};
pub use host::{EventSink, NativeProcess, ProcessHost};
pub use multiplexer::{EventRouter, ObserverError, ObserverId};
pub use options::{LaunchDescriptor, StdioConfig, StdioMode, StdioOption, UtilityProcessOptions};
pub use ports::{MessageChannel, MessagePort, NativePort, PortId, Transferable};
pub use process::{Launcher, UtilityProcess};
pub use relay::{OutputStream, ReadOutcome, Relay};
