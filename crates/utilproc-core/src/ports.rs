//! Message ports: entangled endpoint pairs that can be handed to a worker.
//!
//! Application code works with [`MessagePort`]. Process hosts only ever see
//! the transport-native [`NativePort`]; [`Transferable::into_native`] does the
//! unwrapping at the boundary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(u64);

impl PortId {
    fn next() -> Self {
        Self(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for PortId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

/// Transport-native end of an entangled channel.
#[derive(Debug)]
pub struct NativePort {
    id: PortId,
    /// Messages sent here arrive at the peer end.
    peer: mpsc::UnboundedSender<Value>,
    inbox: mpsc::UnboundedReceiver<Value>,
}

impl NativePort {
    fn pair() -> (Self, Self) {
        let (to_a, inbox_a) = mpsc::unbounded_channel();
        let (to_b, inbox_b) = mpsc::unbounded_channel();
        (
            Self {
                id: PortId::next(),
                peer: to_b,
                inbox: inbox_a,
            },
            Self {
                id: PortId::next(),
                peer: to_a,
                inbox: inbox_b,
            },
        )
    }

    pub const fn id(&self) -> PortId {
        self.id
    }

    /// Post to the peer end. `false` once the peer is gone.
    pub fn post(&self, message: Value) -> bool {
        self.peer.send(message).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.inbox.try_recv().ok()
    }

    /// Split into the id, the sender towards the peer and this end's inbox.
    pub fn into_parts(
        self,
    ) -> (
        PortId,
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        (self.id, self.peer, self.inbox)
    }
}

/// Application-facing end of a [`MessageChannel`].
#[derive(Debug)]
pub struct MessagePort {
    native: NativePort,
}

impl MessagePort {
    pub const fn id(&self) -> PortId {
        self.native.id()
    }

    /// Post a message to the entangled port. `false` once it was closed.
    pub fn post_message(&self, message: Value) -> bool {
        self.native.post(message)
    }

    /// Next message from the entangled port, `None` once it was closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.native.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.native.try_recv()
    }

    /// Disentangle. The peer observes end of messages.
    pub fn close(self) {
        drop(self);
    }
}

/// A pair of entangled ports.
#[derive(Debug)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (a, b) = NativePort::pair();
        Self {
            port1: MessagePort { native: a },
            port2: MessagePort { native: b },
        }
    }

    pub fn into_ports(self) -> (MessagePort, MessagePort) {
        (self.port1, self.port2)
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// An endpoint handed to the worker along with a message.
#[derive(Debug)]
pub enum Transferable {
    Port(MessagePort),
    Native(NativePort),
}

impl Transferable {
    /// Unwrap to the transport-native port. Native ports pass through.
    pub fn into_native(self) -> NativePort {
        match self {
            Self::Port(port) => port.native,
            Self::Native(native) => native,
        }
    }
}

impl From<MessagePort> for Transferable {
    fn from(port: MessagePort) -> Self {
        Self::Port(port)
    }
}

impl From<NativePort> for Transferable {
    fn from(port: NativePort) -> Self {
        Self::Native(port)
    }
}
