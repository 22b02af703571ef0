//! In-memory process host for tests.
//!
//! [`FakeHost`] records every launch and hands out [`FakeProcess`] handles
//! that let a test emit host events in any order it likes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::{Chunk, ExitInfo, HostEvent, StreamData};
use crate::host::{EventSink, NativeProcess, ProcessHost};
use crate::options::LaunchDescriptor;
use crate::ports::{NativePort, PortId};

type LaunchHook = Box<dyn Fn(&dyn EventSink) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message the fake process received.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub message: Value,
    pub port_ids: Vec<PortId>,
}

/// Process host that never starts anything.
#[derive(Default)]
pub struct FakeHost {
    launches: Mutex<Vec<FakeProcess>>,
    failure: Option<String>,
    on_launch: Mutex<Option<LaunchHook>>,
    next_pid: AtomicU32,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(4000),
            ..Self::default()
        }
    }

    /// A host whose every launch fails with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new()
        }
    }

    /// Run `hook` inside `launch`, before the handle is returned.
    pub fn on_launch(&self, hook: impl Fn(&dyn EventSink) + Send + Sync + 'static) {
        *lock(&self.on_launch) = Some(Box::new(hook));
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.launches).len()
    }

    /// The most recently launched process.
    pub fn last(&self) -> Option<FakeProcess> {
        lock(&self.launches).last().cloned()
    }

    pub fn launches(&self) -> Vec<FakeProcess> {
        lock(&self.launches).clone()
    }
}

impl ProcessHost for FakeHost {
    fn launch(
        &self,
        descriptor: &LaunchDescriptor,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn NativeProcess>> {
        if let Some(reason) = &self.failure {
            return Err(Error::LaunchFailure(reason.clone()));
        }
        let process = FakeProcess {
            inner: Arc::new(FakeInner {
                descriptor: descriptor.clone(),
                sink: events,
                pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
                kills: AtomicUsize::new(0),
                kill_result: AtomicBool::new(true),
                exit_on_kill: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                ports: Mutex::new(Vec::new()),
            }),
        };
        lock(&self.launches).push(process.clone());
        if let Some(hook) = lock(&self.on_launch).as_ref() {
            hook(&*process.inner.sink);
        }
        Ok(Box::new(process.native()))
    }
}

struct FakeInner {
    descriptor: LaunchDescriptor,
    sink: Arc<dyn EventSink>,
    pid: u32,
    kills: AtomicUsize,
    kill_result: AtomicBool,
    exit_on_kill: AtomicBool,
    sent: Mutex<Vec<SentMessage>>,
    ports: Mutex<Vec<NativePort>>,
}

/// Test-side view of a fake launch.
#[derive(Clone)]
pub struct FakeProcess {
    inner: Arc<FakeInner>,
}

impl FakeProcess {
    fn native(&self) -> FakeNative {
        FakeNative {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn descriptor(&self) -> &LaunchDescriptor {
        &self.inner.descriptor
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Emit a raw host event.
    pub fn emit(&self, event: HostEvent) -> Result<()> {
        self.inner.sink.dispatch(event)
    }

    pub fn stdout(&self, data: &str) -> Result<()> {
        self.emit(HostEvent::Stdout(StreamData::new(Chunk::data(
            data.as_bytes().to_vec(),
        ))))
    }

    pub fn stderr(&self, data: &str) -> Result<()> {
        self.emit(HostEvent::Stderr(StreamData::new(Chunk::data(
            data.as_bytes().to_vec(),
        ))))
    }

    pub fn exit(&self, code: i32) -> Result<()> {
        self.exit_with(ExitInfo::with_code(code))
    }

    pub fn exit_with(&self, info: ExitInfo) -> Result<()> {
        self.emit(HostEvent::Exit(info))
    }

    pub fn kill_count(&self) -> usize {
        self.inner.kills.load(Ordering::SeqCst)
    }

    /// What the next `kill` reports.
    pub fn set_kill_result(&self, result: bool) {
        self.inner.kill_result.store(result, Ordering::SeqCst);
    }

    /// Make `kill` emit an exit event (signal 9) before returning.
    pub fn set_exit_on_kill(&self, exit: bool) {
        self.inner.exit_on_kill.store(exit, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.inner.sent).clone()
    }

    /// Take the native ports transferred so far.
    pub fn take_ports(&self) -> Vec<NativePort> {
        std::mem::take(&mut *lock(&self.inner.ports))
    }
}

struct FakeNative {
    inner: Arc<FakeInner>,
}

impl NativeProcess for FakeNative {
    fn pid(&self) -> Option<u32> {
        Some(self.inner.pid)
    }

    fn post_message(&self, message: Value, ports: Vec<NativePort>) -> bool {
        lock(&self.inner.sent).push(SentMessage {
            message,
            port_ids: ports.iter().map(NativePort::id).collect(),
        });
        lock(&self.inner.ports).extend(ports);
        true
    }

    fn kill(&self) -> bool {
        self.inner.kills.fetch_add(1, Ordering::SeqCst);
        if self.inner.exit_on_kill.load(Ordering::SeqCst) {
            let _ = self
                .inner
                .sink
                .dispatch(HostEvent::Exit(ExitInfo::with_signal(9)));
        }
        self.inner.kill_result.load(Ordering::SeqCst)
    }
}
