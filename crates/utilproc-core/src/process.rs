//! The utility process facade.
//!
//! [`Launcher`] holds the process host capability and launch defaults;
//! [`UtilityProcess`] is the handle callers keep. Every operation checks
//! whether the worker is still live: once the exit event was processed the
//! output streams are gone and `send_message`/`terminate` report `false`.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::LauncherConfig;
use crate::error::Result;
use crate::events::{ExitInfo, WorkerEvent};
use crate::host::{EventSink, ProcessHost};
use crate::multiplexer::{EventRouter, ObserverError, ObserverId, StreamKind, WorkerState};
use crate::options::{StdioMode, UtilityProcessOptions, normalize};
use crate::ports::Transferable;
use crate::relay::{OutputStream, Relay};

/// Launches utility processes on one process host.
#[derive(Clone)]
pub struct Launcher {
    host: Arc<dyn ProcessHost>,
    config: LauncherConfig,
}

impl Launcher {
    pub fn new(host: Arc<dyn ProcessHost>) -> Self {
        Self::with_config(host, LauncherConfig::default())
    }

    pub fn with_config(host: Arc<dyn ProcessHost>, config: LauncherConfig) -> Self {
        Self { host, config }
    }

    pub const fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Validate the options and launch `entry` with `args`.
    ///
    /// Output relays exist before the host is asked to launch, and the event
    /// router is handed to the host up front, so no event can arrive
    /// unrouted.
    pub fn spawn<I, S>(
        &self,
        entry: impl Into<PathBuf>,
        args: I,
        options: UtilityProcessOptions,
    ) -> Result<UtilityProcess>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into).collect();
        let descriptor = normalize(entry, args, options, &self.config)?;
        let stdio = descriptor.stdio();
        let relay_for = |mode: StdioMode| {
            (mode == StdioMode::Pipe).then(|| Relay::new(self.config.high_water_mark))
        };

        let label = descriptor.service_name().map_or_else(
            || descriptor.entry().display().to_string(),
            str::to_string,
        );
        let state = Arc::new(WorkerState::new(
            label.clone(),
            relay_for(stdio.stdout),
            relay_for(stdio.stderr),
        ));
        let router: Arc<dyn EventSink> = Arc::new(EventRouter::new(Arc::clone(&state)));

        debug!(
            worker = %label,
            stdout = %stdio.stdout,
            stderr = %stdio.stderr,
            "Launching utility process"
        );
        let handle = self.host.launch(&descriptor, router)?;
        state.install(Arc::from(handle));

        let process = UtilityProcess {
            exit_rx: state.subscribe_exit(),
            state,
        };
        info!(worker = %label, pid = ?process.pid(), "Utility process launched");
        Ok(process)
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to a launched worker.
pub struct UtilityProcess {
    state: Arc<WorkerState>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl UtilityProcess {
    /// OS process id while the worker is live.
    pub fn pid(&self) -> Option<u32> {
        self.state.handle().and_then(|handle| handle.pid())
    }

    /// Worker stdout, when piped and the worker has not exited.
    pub fn stdout(&self) -> Option<OutputStream> {
        self.state.relay(StreamKind::Stdout).map(|relay| relay.reader())
    }

    /// Worker stderr, when piped and the worker has not exited.
    pub fn stderr(&self) -> Option<OutputStream> {
        self.state.relay(StreamKind::Stderr).map(|relay| relay.reader())
    }

    /// Send a structured message. `false` once the worker exited.
    pub fn send_message(&self, message: Value) -> bool {
        self.send_message_with_transfer(message, Vec::new())
    }

    /// Send a structured message and hand the given endpoints to the worker.
    ///
    /// Wrapped ports are unwrapped to their native form first.
    pub fn send_message_with_transfer(&self, message: Value, transfer: Vec<Transferable>) -> bool {
        let Some(handle) = self.state.handle() else {
            debug!("send_message on exited utility process ignored");
            return false;
        };
        let ports = transfer.into_iter().map(Transferable::into_native).collect();
        handle.post_message(message, ports)
    }

    /// Ask the host to kill the worker. `false` once the worker exited.
    ///
    /// The exit notification still arrives asynchronously; use [`wait`](Self::wait).
    pub fn terminate(&self) -> bool {
        let Some(handle) = self.state.handle() else {
            debug!("terminate on exited utility process ignored");
            return false;
        };
        handle.kill()
    }

    /// Register an event observer. Observers run synchronously, in
    /// registration order, on the thread that routes host events.
    pub fn on_event<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&WorkerEvent) -> std::result::Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.state.add_observer(observer)
    }

    /// Remove an observer. `false` if it was not registered.
    pub fn off(&self, id: ObserverId) -> bool {
        self.state.remove_observer(id)
    }

    pub fn has_exited(&self) -> bool {
        self.state.has_exited()
    }

    /// Exit info, once the exit notification was dispatched.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait for the exit notification.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or_default(),
            // The sender lives in `self.state`, so it outlives this call.
            Err(_) => ExitInfo::default(),
        }
    }
}

impl std::fmt::Debug for UtilityProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilityProcess")
            .field("pid", &self.pid())
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}
