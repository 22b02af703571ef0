//! Loopback message channel between the host and one worker.
//!
//! The host binds `127.0.0.1:0` before the child is spawned and passes the
//! address in the environment. The worker connects once; frames written
//! before that are queued.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use utilproc_core::events::{EXIT_TAG, STDERR_TAG, STDOUT_TAG};
use utilproc_core::{HostEvent, NativePort, PortId};

use super::frame::{Frame, encode_frame, parse_frame};
use crate::error::HostError;

/// Tag of host events carrying a structured message from the worker.
pub const MESSAGE_TAG: &str = "message";

/// Tags a worker may not use for custom events.
const RESERVED_TAGS: [&str; 5] = [STDOUT_TAG, STDERR_TAG, EXIT_TAG, MESSAGE_TAG, "spawn"];

enum Command {
    Send(Frame),
    /// Route frames the worker addresses to `port` into `to_peer`.
    Attach {
        port: PortId,
        to_peer: mpsc::UnboundedSender<Value>,
    },
}

/// Host side of a bound channel, before the worker was spawned.
pub struct ChannelServer {
    listener: std::net::TcpListener,
    addr: SocketAddr,
}

impl ChannelServer {
    pub fn bind() -> Result<Self, HostError> {
        let listener =
            std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(HostError::ChannelBind)?;
        listener.set_nonblocking(true).map_err(HostError::ChannelBind)?;
        let addr = listener.local_addr().map_err(HostError::ChannelBind)?;
        Ok(Self { listener, addr })
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start serving on `runtime`. Inbound messages and events go to
    /// `events`. The task gives up waiting for a connection once `exited`
    /// turns `true`, and ends when the worker closes its end.
    pub fn start(
        self,
        runtime: &Handle,
        events: mpsc::UnboundedSender<HostEvent>,
        exited: watch::Receiver<bool>,
    ) -> Result<(ChannelHandle, JoinHandle<()>), HostError> {
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(self.listener).map_err(HostError::ChannelBind)?
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(serve(listener, commands_rx, events, exited));
        Ok((
            ChannelHandle {
                commands: commands_tx,
                runtime: runtime.clone(),
            },
            task,
        ))
    }
}

/// Sending side of the channel, owned by the process handle.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    runtime: Handle,
}

impl ChannelHandle {
    /// Queue `message` for the worker and bridge `ports` over the channel.
    /// `false` once the connection is gone.
    pub fn post(&self, message: Value, ports: Vec<NativePort>) -> bool {
        let mut ids = Vec::with_capacity(ports.len());
        let mut inboxes = Vec::with_capacity(ports.len());
        for port in ports {
            let (id, to_peer, inbox) = port.into_parts();
            if self.commands.send(Command::Attach { port: id, to_peer }).is_err() {
                return false;
            }
            ids.push(id);
            inboxes.push((id, inbox));
        }
        let frame = Frame::Message {
            data: message,
            ports: ids,
        };
        if self.commands.send(Command::Send(frame)).is_err() {
            return false;
        }
        for (id, inbox) in inboxes {
            self.runtime.spawn(forward_port(id, inbox, self.commands.clone()));
        }
        true
    }
}

/// Relay what the application posts to the peer of a transferred port.
async fn forward_port(
    port: PortId,
    mut inbox: mpsc::UnboundedReceiver<Value>,
    commands: mpsc::UnboundedSender<Command>,
) {
    while let Some(data) = inbox.recv().await {
        if commands
            .send(Command::Send(Frame::PortMessage { port, data }))
            .is_err()
        {
            return;
        }
    }
    trace!(%port, "Port peer closed");
    let _ = commands.send(Command::Send(Frame::PortClose { port }));
}

async fn serve(
    listener: TcpListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<HostEvent>,
    mut exited: watch::Receiver<bool>,
) {
    let stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "Worker connected to message channel");
                stream
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept worker connection");
                return;
            }
        },
        () = wait_exited(&mut exited) => {
            debug!("Worker exited without connecting to message channel");
            return;
        }
    };
    drop(listener);

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut bridged: HashMap<PortId, mpsc::UnboundedSender<Value>> = HashMap::new();
    let mut commands_open = true;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_inbound(&line, &events, &mut bridged),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Message channel read failed");
                    break;
                }
            },
            command = commands.recv(), if commands_open => match command {
                Some(Command::Attach { port, to_peer }) => {
                    bridged.insert(port, to_peer);
                }
                Some(Command::Send(frame)) => {
                    if let Err(e) = write_frame(&mut write_half, &frame).await {
                        warn!(error = %e, "Message channel write failed");
                        break;
                    }
                }
                None => commands_open = false,
            },
        }
    }
    debug!(bridged_ports = bridged.len(), "Message channel closed");
}

async fn wait_exited(exited: &mut watch::Receiver<bool>) {
    let _ = exited.wait_for(|exited| *exited).await;
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let line = encode_frame(frame)?;
    writer.write_all(&line).await?;
    writer.flush().await
}

fn handle_inbound(
    line: &str,
    events: &mpsc::UnboundedSender<HostEvent>,
    bridged: &mut HashMap<PortId, mpsc::UnboundedSender<Value>>,
) {
    if line.trim().is_empty() {
        return;
    }
    let frame = match parse_frame(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Malformed frame from worker");
            return;
        }
    };
    match frame {
        Frame::Message { data, ports } => {
            if !ports.is_empty() {
                warn!(
                    count = ports.len(),
                    "Ports sent by the worker are not supported, dropping them"
                );
            }
            let _ = events.send(HostEvent::other(MESSAGE_TAG, data));
        }
        Frame::PortMessage { port, data } => match bridged.get(&port) {
            Some(to_peer) => {
                if to_peer.send(data).is_err() {
                    debug!(%port, "Port peer already closed");
                    bridged.remove(&port);
                }
            }
            None => debug!(%port, "Message for unknown port dropped"),
        },
        Frame::PortClose { port } => {
            if bridged.remove(&port).is_some() {
                trace!(%port, "Worker closed port");
            }
        }
        Frame::Event { tag, payload } => {
            if RESERVED_TAGS.contains(&tag.as_str()) {
                warn!(tag = %tag, "Worker used a reserved event tag, dropping event");
                return;
            }
            let _ = events.send(HostEvent::other(tag, payload));
        }
        Frame::Unknown => debug!("Unknown frame kind from worker skipped"),
    }
}
