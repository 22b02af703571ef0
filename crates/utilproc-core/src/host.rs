//! Capabilities a process host provides to the core.
//!
//! A host turns a [`LaunchDescriptor`] into a running process and reports
//! everything that happens to it through one [`EventSink`]. The sink is
//! handed over before the process starts, so no event can be missed.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::events::HostEvent;
use crate::options::LaunchDescriptor;
use crate::ports::NativePort;

/// Receives every event a host emits, in emission order, one at a time.
pub trait EventSink: Send + Sync {
    /// Route one event. Errors are observer failures the host should log;
    /// they never stop routing.
    fn dispatch(&self, event: HostEvent) -> Result<()>;
}

/// Handle to one launched process.
pub trait NativeProcess: Send + Sync {
    /// OS process identifier, once known.
    fn pid(&self) -> Option<u32>;

    /// Send a structured message, transferring the given ports.
    fn post_message(&self, message: Value, ports: Vec<NativePort>) -> bool;

    /// Request forced termination. Does not wait for the exit event.
    fn kill(&self) -> bool;
}

/// Launches processes.
pub trait ProcessHost: Send + Sync {
    /// Start a process for `descriptor`, reporting its events to `events`.
    ///
    /// Fails with [`Error::LaunchFailure`](crate::Error::LaunchFailure) when
    /// the process could not be created.
    fn launch(
        &self,
        descriptor: &LaunchDescriptor,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn NativeProcess>>;
}
