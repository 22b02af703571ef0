//! End-to-end worker lifecycle against the in-memory host.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::json;
use tokio_stream::StreamExt;
use utilproc_core::testing::FakeHost;
use utilproc_core::{
    Chunk, Error, ExitInfo, HostEvent, Launcher, LauncherConfig, MessageChannel, ReadOutcome,
    StreamData, UtilityProcessOptions, WorkerEvent,
};

const NO_ARGS: [&str; 0] = [];

fn launcher() -> (Arc<FakeHost>, Launcher) {
    let host = Arc::new(FakeHost::new());
    let launcher = Launcher::new(Arc::clone(&host) as _);
    (host, launcher)
}

fn piped() -> UtilityProcessOptions {
    UtilityProcessOptions::default().with_stdio("pipe")
}

fn exit_counter(worker: &utilproc_core::UtilityProcess) -> Arc<Mutex<Vec<ExitInfo>>> {
    let exits = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&exits);
    worker.on_event(move |event| {
        if let WorkerEvent::Exit(info) = event {
            seen.lock().unwrap().push(*info);
        }
        Ok(())
    });
    exits
}

#[tokio::test]
async fn piped_chunks_arrive_in_order_then_exit_once() {
    let (host, launcher) = launcher();
    let worker = launcher.spawn("worker.js", NO_ARGS, piped()).unwrap();
    let fake = host.last().unwrap();
    let exits = exit_counter(&worker);

    fake.stdout("ab").unwrap();
    fake.stdout("cd").unwrap();

    let mut stdout = worker.stdout().unwrap();
    assert_eq!(stdout.next().await, Some(Bytes::from_static(b"ab")));
    assert_eq!(stdout.next().await, Some(Bytes::from_static(b"cd")));

    fake.exit(0).unwrap();
    fake.exit(1).unwrap();
    assert_eq!(*exits.lock().unwrap(), vec![ExitInfo::with_code(0)]);
    assert!(worker.stdout().is_none());
    assert!(worker.stderr().is_none());
    assert_eq!(worker.wait().await, ExitInfo::with_code(0));
}

#[tokio::test]
async fn resume_waits_for_reader_demand() {
    let config = LauncherConfig {
        high_water_mark: 4,
        ..LauncherConfig::default()
    };
    let host = Arc::new(FakeHost::new());
    let launcher = Launcher::with_config(Arc::clone(&host) as _, config);
    let worker = launcher.spawn("worker.js", NO_ARGS, piped()).unwrap();
    let fake = host.last().unwrap();
    let stdout = worker.stdout().unwrap();

    let resumed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resumed);
    fake.emit(HostEvent::Stdout(StreamData::with_resume(
        Chunk::data(&b"12345678"[..]),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )))
    .unwrap();
    // Nobody read yet: the chunk is queued and the worker stays paused.
    assert_eq!(resumed.load(Ordering::SeqCst), 0);

    // The first read drains the chunk past the high-water mark: still paused.
    assert_eq!(
        stdout.try_read(),
        ReadOutcome::Data(Bytes::from_static(b"12345678"))
    );
    assert_eq!(resumed.load(Ordering::SeqCst), 0);

    // The next read finds the buffer empty and asks for more.
    assert_eq!(stdout.try_read(), ReadOutcome::Pending);
    assert_eq!(resumed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn end_of_stream_finishes_reader_before_exit() {
    let (host, launcher) = launcher();
    let worker = launcher.spawn("worker.js", NO_ARGS, piped()).unwrap();
    let fake = host.last().unwrap();

    fake.stderr("line 1\n").unwrap();
    fake.emit(HostEvent::Stderr(StreamData::new(Chunk::End))).unwrap();

    let stderr = worker.stderr().unwrap();
    assert_eq!(&stderr.read_to_end().await[..], b"line 1\n");
    assert!(!worker.has_exited());
}

#[tokio::test]
async fn unread_output_is_flushed_when_worker_exits() {
    let (host, launcher) = launcher();
    let worker = launcher.spawn("worker.js", NO_ARGS, piped()).unwrap();
    let fake = host.last().unwrap();
    let stdout = worker.stdout().unwrap();

    fake.stdout("tail").unwrap();
    fake.exit(0).unwrap();

    assert_eq!(&stdout.read_to_end().await[..], b"tail");
}

#[test]
fn observer_failure_does_not_block_cleanup() {
    let (host, launcher) = launcher();
    let worker = launcher.spawn("worker.js", NO_ARGS, piped()).unwrap();
    let fake = host.last().unwrap();

    worker.on_event(|_| Err("observer broke".into()));
    let later = exit_counter(&worker);

    let err = fake.exit(2).unwrap_err();
    assert!(matches!(err, Error::Observer(ref msg) if msg.contains("observer broke")));
    assert_eq!(*later.lock().unwrap(), vec![ExitInfo::with_code(2)]);
    assert!(worker.has_exited());
    assert!(worker.stdout().is_none());
    assert_eq!(worker.pid(), None);
}

#[test]
fn panicking_observer_is_reported_after_cleanup() {
    let (host, launcher) = launcher();
    let worker = launcher.spawn("worker.js", NO_ARGS, piped()).unwrap();
    let fake = host.last().unwrap();

    worker.on_event(|_| panic!("observer exploded"));
    let err = fake.exit(0).unwrap_err();
    assert!(matches!(err, Error::Observer(_)));
    assert!(!worker.terminate());
}

#[test]
fn other_events_are_forwarded_verbatim() {
    let (host, launcher) = launcher();
    let worker = launcher
        .spawn("worker.js", NO_ARGS, UtilityProcessOptions::default())
        .unwrap();
    let fake = host.last().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = worker.on_event(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });

    fake.emit(HostEvent::other("message", json!({"progress": 50}))).unwrap();
    assert!(worker.off(id));
    assert!(!worker.off(id));
    fake.emit(HostEvent::other("message", json!({"progress": 100}))).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![WorkerEvent::Other {
            tag: "message".into(),
            payload: json!({"progress": 50}),
        }]
    );
}

#[test]
fn ignore_mode_tolerates_stray_stream_data() {
    let (host, launcher) = launcher();
    let worker = launcher
        .spawn(
            "worker.js",
            NO_ARGS,
            UtilityProcessOptions::default().with_stdio("ignore"),
        )
        .unwrap();
    let fake = host.last().unwrap();

    assert!(worker.stdout().is_none());
    fake.stdout("stray").unwrap();
    fake.stderr("stray").unwrap();
    assert!(!worker.has_exited());
}

#[test]
fn transferred_endpoint_is_sent_unwrapped() {
    let (host, launcher) = launcher();
    let worker = launcher
        .spawn("worker.js", NO_ARGS, UtilityProcessOptions::default())
        .unwrap();
    let fake = host.last().unwrap();

    let (port, mut peer) = MessageChannel::new().into_ports();
    let id = port.id();
    assert!(worker.send_message_with_transfer(json!("connect"), vec![port.into()]));

    let sent = fake.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].port_ids, vec![id]);

    let native = fake.take_ports().pop().unwrap();
    assert!(native.post(json!("through the native end")));
    assert_eq!(peer.try_recv(), Some(json!("through the native end")));
}

#[test]
fn terminate_twice_across_exit() {
    let (host, launcher) = launcher();
    let worker = launcher
        .spawn("worker.js", NO_ARGS, UtilityProcessOptions::default())
        .unwrap();
    let fake = host.last().unwrap();

    assert!(worker.terminate());
    fake.exit_with(ExitInfo::with_signal(15)).unwrap();
    assert!(!worker.terminate());
    assert_eq!(fake.kill_count(), 1);
}

#[test]
fn invalid_options_never_reach_the_host() {
    let (host, launcher) = launcher();
    let options = UtilityProcessOptions::from_json(json!({"stdio": ["ignore", "pipe"]})).unwrap();
    let err = launcher.spawn("worker.js", NO_ARGS, options).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgument(ref msg) if msg == "configuration missing for stdin, stdout or stderr."
    ));

    let err = UtilityProcessOptions::from_json(json!({"cwd": 42})).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(host.launch_count(), 0);
}

#[tokio::test]
async fn wait_resolves_for_late_subscribers() {
    let (host, launcher) = launcher();
    let worker = launcher
        .spawn("worker.js", NO_ARGS, UtilityProcessOptions::default())
        .unwrap();
    host.last().unwrap().exit(5).unwrap();

    assert_eq!(worker.exit_info(), Some(ExitInfo::with_code(5)));
    assert_eq!(worker.wait().await, ExitInfo::with_code(5));
}
