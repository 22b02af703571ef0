//! Worker subprocess lifecycle on tokio.
//!
//! Spawns the worker, pumps its piped output, reaps it and reports
//! everything through one event queue that a single dispatcher task drains
//! into the router, so the router sees events strictly in emission order.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utilproc_core::multiplexer::StreamKind;
use utilproc_core::{
    EventSink, ExitInfo, HostEvent, LaunchDescriptor, LauncherConfig, NativePort, NativeProcess,
    ProcessHost, StdioMode,
};

use super::pump::pump;
use crate::channel::{ChannelHandle, ChannelServer};
use crate::error::HostError;

/// Environment variable carrying the message channel address.
pub const CHANNEL_ENV: &str = "UTILPROC_CHANNEL";
/// Environment variable carrying the worker's service name, when set.
pub const SERVICE_NAME_ENV: &str = "UTILPROC_SERVICE_NAME";

/// Tag of the event emitted once the child was created.
pub const SPAWN_TAG: &str = "spawn";

/// Process host backed by `tokio::process`.
///
/// `launch` must be called from within a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessHost {
    config: LauncherConfig,
}

impl TokioProcessHost {
    pub const fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Build the command for `descriptor`. The worker connects back to
    /// `channel`.
    pub fn command(&self, descriptor: &LaunchDescriptor, channel: SocketAddr) -> Command {
        let mut cmd = match &self.config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.args(descriptor.exec_args()).arg(descriptor.entry());
                cmd
            }
            None => {
                if !descriptor.exec_args().is_empty() {
                    debug!(
                        exec_args = ?descriptor.exec_args(),
                        "No interpreter configured, exec args ignored"
                    );
                }
                Command::new(descriptor.entry())
            }
        };
        let stdio = descriptor.stdio();
        cmd.args(descriptor.args())
            .envs(descriptor.env())
            .env(CHANNEL_ENV, channel.to_string())
            .stdin(Stdio::null())
            .stdout(stdio_for(stdio.stdout))
            .stderr(stdio_for(stdio.stderr))
            .kill_on_drop(true);
        if let Some(name) = descriptor.service_name() {
            cmd.env(SERVICE_NAME_ENV, name);
        }
        if let Some(cwd) = descriptor.cwd() {
            cmd.current_dir(cwd);
        }
        cmd
    }

    fn start(
        &self,
        descriptor: &LaunchDescriptor,
        sink: Arc<dyn EventSink>,
    ) -> Result<TokioProcess, HostError> {
        let runtime = Handle::try_current().map_err(|_| HostError::NoRuntime)?;
        let channel = ChannelServer::bind()?;
        let mut cmd = self.command(descriptor, channel.addr());

        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        info!(
            program = %program,
            entry = %descriptor.entry().display(),
            service_name = ?descriptor.service_name(),
            channel = %channel.addr(),
            "Spawning worker process"
        );
        let mut child = cmd
            .spawn()
            .map_err(|source| HostError::Spawn { program, source })?;
        let pid = child.id();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        runtime.spawn(dispatch(events_rx, sink));
        // First event, queued before any pump can produce output.
        let _ = events_tx.send(HostEvent::other(SPAWN_TAG, json!({ "pid": pid })));

        let (reaped_tx, reaped_rx) = watch::channel(false);
        let (channel, channel_task) =
            channel.start(&runtime, events_tx.clone(), reaped_rx.clone())?;

        let stdio = descriptor.stdio();
        let chunk_size = self.config.read_chunk_size;
        let mut tasks = Vec::with_capacity(3);
        if stdio.stdout == StdioMode::Pipe {
            let reader = child.stdout.take().ok_or(HostError::MissingPipe("stdout"))?;
            tasks.push(runtime.spawn(pump(
                reader,
                StreamKind::Stdout,
                chunk_size,
                events_tx.clone(),
                reaped_rx.clone(),
            )));
        }
        if stdio.stderr == StdioMode::Pipe {
            let reader = child.stderr.take().ok_or(HostError::MissingPipe("stderr"))?;
            tasks.push(runtime.spawn(pump(
                reader,
                StreamKind::Stderr,
                chunk_size,
                events_tx.clone(),
                reaped_rx.clone(),
            )));
        }
        tasks.push(channel_task);

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        runtime.spawn(reap(child, kill_rx, reaped_tx, tasks, events_tx));

        Ok(TokioProcess {
            pid,
            kill: kill_tx,
            channel,
        })
    }
}

impl ProcessHost for TokioProcessHost {
    fn launch(
        &self,
        descriptor: &LaunchDescriptor,
        events: Arc<dyn EventSink>,
    ) -> utilproc_core::Result<Box<dyn NativeProcess>> {
        match self.start(descriptor, events) {
            Ok(process) => Ok(Box::new(process)),
            Err(e) => {
                warn!(entry = %descriptor.entry().display(), error = %e, "Worker launch failed");
                Err(e.into())
            }
        }
    }
}

fn stdio_for(mode: StdioMode) -> Stdio {
    match mode {
        StdioMode::Ignore => Stdio::null(),
        StdioMode::Inherit => Stdio::inherit(),
        StdioMode::Pipe => Stdio::piped(),
    }
}

/// Deliver queued events to the router one at a time.
async fn dispatch(mut events: mpsc::UnboundedReceiver<HostEvent>, sink: Arc<dyn EventSink>) {
    while let Some(event) = events.recv().await {
        let tag = event.tag().to_string();
        if let Err(e) = sink.dispatch(event) {
            warn!(tag = %tag, error = %e, "Event observer failed");
        }
    }
}

/// Wait for the child, honouring kill requests, then for every output pump
/// and the message channel. Only then is the exit reported.
async fn reap(
    mut child: Child,
    mut kill: mpsc::UnboundedReceiver<()>,
    reaped: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let pid = child.id();
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill.recv() => {
                debug!(pid = ?pid, "Killing worker");
                if let Err(e) = child.start_kill() {
                    warn!(pid = ?pid, error = %e, "Failed to kill worker");
                }
            }
        }
    };
    drop(kill);
    reaped.send_replace(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!(pid = ?pid, error = %e, "Worker I/O task failed");
        }
    }

    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Failed to wait for worker");
            ExitInfo::default()
        }
    };
    info!(pid = ?pid, code = ?info.code, signal = ?info.signal, "Worker exited");
    let _ = events.send(HostEvent::Exit(info));
}

/// Handle to a worker launched by [`TokioProcessHost`].
pub struct TokioProcess {
    pid: Option<u32>,
    kill: mpsc::UnboundedSender<()>,
    channel: ChannelHandle,
}

impl NativeProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn post_message(&self, message: Value, ports: Vec<NativePort>) -> bool {
        self.channel.post(message, ports)
    }

    fn kill(&self) -> bool {
        self.kill.send(()).is_ok()
    }
}

impl std::fmt::Debug for TokioProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
