//! Event router for a single worker.
//!
//! The host's one event channel carries stdout data, stderr data, the exit
//! event and arbitrary other tags. The router feeds stream data into the
//! matching [`Relay`], fans everything else out to observers, and runs the
//! one-time teardown when the exit event arrives.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{ExitInfo, HostEvent, StreamData, WorkerEvent};
use crate::host::{EventSink, NativeProcess};
use crate::relay::Relay;

/// Failure reported by an observer.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronous event observer.
pub type Observer = Arc<dyn Fn(&WorkerEvent) -> std::result::Result<(), ObserverError> + Send + Sync>;

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Which output stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// References owned by a live worker. Emptied exactly once, at exit.
struct Slots {
    handle: Option<Arc<dyn NativeProcess>>,
    stdout: Option<Relay>,
    stderr: Option<Relay>,
    exited: bool,
}

struct ObserverList {
    next_id: u64,
    entries: Vec<(ObserverId, Observer)>,
}

/// State shared between the router and the [`UtilityProcess`](crate::UtilityProcess).
pub(crate) struct WorkerState {
    slots: Mutex<Slots>,
    observers: Mutex<ObserverList>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    label: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerState {
    pub(crate) fn new(label: String, stdout: Option<Relay>, stderr: Option<Relay>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            slots: Mutex::new(Slots {
                handle: None,
                stdout,
                stderr,
                exited: false,
            }),
            observers: Mutex::new(ObserverList {
                next_id: 1,
                entries: Vec::new(),
            }),
            exit_tx,
            label,
        }
    }

    /// Attach the host's handle once launch returned.
    ///
    /// A worker that already exited during launch never gets it.
    pub(crate) fn install(&self, handle: Arc<dyn NativeProcess>) {
        let mut slots = lock(&self.slots);
        if slots.exited {
            debug!(worker = %self.label, "Worker exited during launch; handle released");
            return;
        }
        slots.handle = Some(handle);
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn NativeProcess>> {
        lock(&self.slots).handle.clone()
    }

    pub(crate) fn relay(&self, kind: StreamKind) -> Option<Relay> {
        let slots = lock(&self.slots);
        match kind {
            StreamKind::Stdout => slots.stdout.clone(),
            StreamKind::Stderr => slots.stderr.clone(),
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        lock(&self.slots).exited
    }

    pub(crate) fn subscribe_exit(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_tx.subscribe()
    }

    pub(crate) fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&WorkerEvent) -> std::result::Result<(), ObserverError> + Send + Sync + 'static,
    {
        let mut list = lock(&self.observers);
        let id = ObserverId(list.next_id);
        list.next_id += 1;
        list.entries.push((id, Arc::new(observer)));
        id
    }

    pub(crate) fn remove_observer(&self, id: ObserverId) -> bool {
        let mut list = lock(&self.observers);
        let before = list.entries.len();
        list.entries.retain(|(entry, _)| *entry != id);
        list.entries.len() != before
    }

    /// Run every observer, even after one failed. Returns the first failure.
    fn notify(&self, event: &WorkerEvent) -> Result<()> {
        let observers: Vec<Observer> = lock(&self.observers)
            .entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        let mut first_error = None;
        for observer in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "observer panicked".to_string(),
            };
            warn!(worker = %self.label, tag = event.tag(), error = %failure, "Event observer failed");
            first_error.get_or_insert(failure);
        }
        first_error.map_or(Ok(()), |msg| Err(Error::Observer(msg)))
    }
}

/// Routes host events for one worker. Installed as the host's [`EventSink`].
pub struct EventRouter {
    state: Arc<WorkerState>,
}

impl EventRouter {
    pub(crate) const fn new(state: Arc<WorkerState>) -> Self {
        Self { state }
    }

    fn route_stream(&self, kind: StreamKind, data: StreamData) {
        let relay = {
            let slots = lock(&self.state.slots);
            if slots.exited {
                debug!(worker = %self.state.label, stream = kind.as_str(), "Stream data after exit ignored");
                return;
            }
            match kind {
                StreamKind::Stdout => slots.stdout.clone(),
                StreamKind::Stderr => slots.stderr.clone(),
            }
        };
        match relay {
            Some(relay) => relay.deliver(data),
            None => debug!(
                worker = %self.state.label,
                stream = kind.as_str(),
                bytes = data.chunk.len(),
                "Stream is not piped; data dropped"
            ),
        }
    }

    fn forward(&self, tag: String, payload: serde_json::Value) -> Result<()> {
        if self.state.has_exited() {
            debug!(worker = %self.state.label, tag = %tag, "Event after exit ignored");
            return Ok(());
        }
        self.state.notify(&WorkerEvent::Other { tag, payload })
    }

    /// Notify observers, release the handle and both relays, then publish
    /// the exit to waiters, in that order. Cleanup runs whatever the observers do; their first failure is
    /// returned afterwards.
    fn handle_exit(&self, info: ExitInfo) -> Result<()> {
        {
            let mut slots = lock(&self.state.slots);
            if slots.exited {
                warn!(worker = %self.state.label, ?info, "Duplicate exit event ignored");
                return Ok(());
            }
            slots.exited = true;
        }

        let notified = self.state.notify(&WorkerEvent::Exit(info));

        let (handle, stdout, stderr) = {
            let mut slots = lock(&self.state.slots);
            (slots.handle.take(), slots.stdout.take(), slots.stderr.take())
        };
        drop(handle);
        if let Some(relay) = stdout {
            relay.close();
        }
        if let Some(relay) = stderr {
            relay.close();
        }
        self.state.exit_tx.send_replace(Some(info));

        info!(
            worker = %self.state.label,
            code = ?info.code,
            signal = ?info.signal,
            "Utility process exited"
        );
        notified
    }
}

impl EventSink for EventRouter {
    fn dispatch(&self, event: HostEvent) -> Result<()> {
        match event {
            HostEvent::Stdout(data) => {
                self.route_stream(StreamKind::Stdout, data);
                Ok(())
            }
            HostEvent::Stderr(data) => {
                self.route_stream(StreamKind::Stderr, data);
                Ok(())
            }
            HostEvent::Exit(info) => self.handle_exit(info),
            HostEvent::Other { tag, payload } => self.forward(tag, payload),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::Chunk;
    use crate::relay::ReadOutcome;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn router(stdout: bool, stderr: bool) -> (Arc<WorkerState>, EventRouter) {
        let state = Arc::new(WorkerState::new(
            "test".to_string(),
            stdout.then(|| Relay::new(1024)),
            stderr.then(|| Relay::new(1024)),
        ));
        let router = EventRouter::new(Arc::clone(&state));
        (state, router)
    }

    fn stdout(s: &str) -> HostEvent {
        HostEvent::Stdout(StreamData::new(Chunk::data(s.as_bytes().to_vec())))
    }

    #[test]
    fn stream_events_reach_matching_relay() {
        let (state, router) = router(true, true);
        router.dispatch(stdout("out")).unwrap();
        router
            .dispatch(HostEvent::Stderr(StreamData::new(Chunk::data(&b"err"[..]))))
            .unwrap();

        let out = state.relay(StreamKind::Stdout).unwrap().reader();
        let err = state.relay(StreamKind::Stderr).unwrap().reader();
        assert_eq!(out.try_read(), ReadOutcome::Data(bytes::Bytes::from_static(b"out")));
        assert_eq!(err.try_read(), ReadOutcome::Data(bytes::Bytes::from_static(b"err")));
    }

    #[test]
    fn unpiped_stream_event_is_noop() {
        let (_state, router) = router(false, false);
        router.dispatch(stdout("nobody listens")).unwrap();
    }

    #[test]
    fn other_tags_forwarded_verbatim() {
        let (state, router) = router(false, false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        state.add_observer(move |event: &WorkerEvent| {
            s.lock().unwrap().push(event.clone());
            Ok(())
        });

        router
            .dispatch(HostEvent::other("message", json!({"n": 1})))
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![WorkerEvent::Other {
                tag: "message".to_string(),
                payload: json!({"n": 1})
            }]
        );
    }

    #[test]
    fn exit_is_processed_once() {
        let (state, router) = router(true, false);
        let exits = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&exits);
        state.add_observer(move |event: &WorkerEvent| {
            if matches!(event, WorkerEvent::Exit(_)) {
                e.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        router.dispatch(HostEvent::Exit(ExitInfo::with_code(0))).unwrap();
        router.dispatch(HostEvent::Exit(ExitInfo::with_code(1))).unwrap();

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert!(state.relay(StreamKind::Stdout).is_none());
        assert_eq!(*state.subscribe_exit().borrow(), Some(ExitInfo::with_code(0)));
    }

    #[test]
    fn failing_observer_does_not_block_cleanup() {
        let (state, router) = router(true, true);
        let later = Arc::new(AtomicUsize::new(0));
        let l = Arc::clone(&later);
        state.add_observer(|_: &WorkerEvent| Err("boom".into()));
        state.add_observer(|_: &WorkerEvent| panic!("observer blew up"));
        state.add_observer(move |_: &WorkerEvent| {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = router
            .dispatch(HostEvent::Exit(ExitInfo::with_code(2)))
            .unwrap_err();
        assert!(matches!(err, Error::Observer(msg) if msg == "boom"));
        assert_eq!(later.load(Ordering::SeqCst), 1);
        assert!(state.relay(StreamKind::Stdout).is_none());
        assert!(state.relay(StreamKind::Stderr).is_none());
        assert!(state.has_exited());
    }

    #[test]
    fn events_after_exit_are_not_routed() {
        let (state, router) = router(true, false);
        let reader = state.relay(StreamKind::Stdout).unwrap().reader();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        state.add_observer(move |_: &WorkerEvent| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        router.dispatch(HostEvent::Exit(ExitInfo::with_code(0))).unwrap();
        router.dispatch(stdout("late")).unwrap();
        router.dispatch(HostEvent::other("message", json!(null))).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(reader.try_read(), ReadOutcome::End);
    }

    #[test]
    fn removed_observer_not_called() {
        let (state, router) = router(false, false);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = state.add_observer(move |_: &WorkerEvent| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(state.remove_observer(id));
        assert!(!state.remove_observer(id));

        router.dispatch(HostEvent::other("spawn", json!({}))).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    struct LiveProcess;

    impl NativeProcess for LiveProcess {
        fn pid(&self) -> Option<u32> {
            Some(77)
        }

        fn post_message(&self, _message: serde_json::Value, _ports: Vec<crate::NativePort>) -> bool {
            true
        }

        fn kill(&self) -> bool {
            true
        }
    }

    #[test]
    fn exit_observers_run_before_teardown_and_waiters_after() {
        let (state, router) = router(true, true);
        state.install(Arc::new(LiveProcess));

        let during = Arc::new(Mutex::new(None));
        let d = Arc::clone(&during);
        let weak = Arc::downgrade(&state);
        state.add_observer(move |event: &WorkerEvent| {
            if matches!(event, WorkerEvent::Exit(_)) {
                let state = weak.upgrade().unwrap();
                *d.lock().unwrap() = Some((
                    state.handle().and_then(|h| h.pid()),
                    state.relay(StreamKind::Stdout).is_some(),
                    state.subscribe_exit().borrow().is_some(),
                ));
            }
            Ok(())
        });

        router.dispatch(HostEvent::Exit(ExitInfo::with_code(0))).unwrap();

        assert_eq!(*during.lock().unwrap(), Some((Some(77), true, false)));
        assert!(state.handle().is_none());
        assert!(state.relay(StreamKind::Stdout).is_none());
        assert!(state.relay(StreamKind::Stderr).is_none());
        assert_eq!(*state.subscribe_exit().borrow(), Some(ExitInfo::with_code(0)));
    }
}
