//! Integration tests driving real worker processes through `/bin/sh`.

#![cfg(unix)]
#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use utilproc_core::{
    Error, ExitInfo, Launcher, LauncherConfig, UtilityProcess, UtilityProcessOptions, WorkerEvent,
};
use utilproc_host::TokioProcessHost;

const NO_ARGS: [&str; 0] = [];

fn sh_launcher(config: LauncherConfig) -> Launcher {
    let config = LauncherConfig {
        interpreter: Some(PathBuf::from("/bin/sh")),
        ..config
    };
    Launcher::with_config(Arc::new(TokioProcessHost::new(config.clone())), config)
}

fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    std::fs::write(&path, body).unwrap();
    path
}

fn piped() -> UtilityProcessOptions {
    UtilityProcessOptions::default().with_stdio("pipe")
}

async fn wait(worker: &UtilityProcess) -> ExitInfo {
    tokio::time::timeout(Duration::from_secs(10), worker.wait())
        .await
        .expect("worker did not exit in time")
}

#[tokio::test]
async fn piped_output_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let entry = script(dir.path(), "printf 'hello'\nprintf 'oops' >&2\nexit 3\n");
    let worker = sh_launcher(LauncherConfig::default())
        .spawn(entry, NO_ARGS, piped())
        .unwrap();

    let stdout = worker.stdout().unwrap();
    let stderr = worker.stderr().unwrap();
    let (out, err) = tokio::join!(stdout.read_to_end(), stderr.read_to_end());
    assert_eq!(&out[..], b"hello");
    assert_eq!(&err[..], b"oops");

    assert_eq!(wait(&worker).await, ExitInfo::with_code(3));
    assert!(worker.stdout().is_none());
    assert!(!worker.terminate());
    assert!(!worker.send_message(json!("late")));
}

#[tokio::test]
async fn arguments_reach_the_script() {
    let dir = tempfile::tempdir().unwrap();
    let entry = script(dir.path(), "printf '%s,' \"$@\"\n");
    let worker = sh_launcher(LauncherConfig::default())
        .spawn(entry, ["one", "two words"], piped())
        .unwrap();

    let out = worker.stdout().unwrap().read_to_end().await;
    assert_eq!(&out[..], b"one,two words,");
    assert!(wait(&worker).await.success());
}

#[tokio::test]
async fn large_output_survives_small_high_water_mark() {
    let dir = tempfile::tempdir().unwrap();
    let entry = script(dir.path(), "exec head -c 200000 /dev/zero\n");
    let config = LauncherConfig {
        high_water_mark: 1024,
        read_chunk_size: 4096,
        ..LauncherConfig::default()
    };
    let worker = sh_launcher(config)
        .spawn(
            entry,
            NO_ARGS,
            UtilityProcessOptions::default().with_stdio(["ignore", "pipe", "ignore"]),
        )
        .unwrap();
    assert!(worker.stderr().is_none());

    let out = worker.stdout().unwrap().read_to_end().await;
    assert_eq!(out.len(), 200_000);
    assert!(out.iter().all(|b| *b == 0));
    assert!(wait(&worker).await.success());
}

#[tokio::test]
async fn environment_and_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let entry = script(
        dir.path(),
        "printf '%s|%s|%s|%s' \"$(pwd -P)\" \"$MODE\" \"$UTILPROC_SERVICE_NAME\" \"$UTILPROC_CHANNEL\"\n",
    );
    let worker = sh_launcher(LauncherConfig::default())
        .spawn(
            entry,
            NO_ARGS,
            piped()
                .with_cwd(work.path())
                .with_env("MODE", "fast")
                .with_service_name("indexer"),
        )
        .unwrap();

    let out = worker.stdout().unwrap().read_to_end().await;
    let out = String::from_utf8(out.to_vec()).unwrap();
    let fields: Vec<&str> = out.split('|').collect();
    let cwd = work.path().canonicalize().unwrap();
    assert_eq!(fields[0], cwd.to_str().unwrap());
    assert_eq!(fields[1], "fast");
    assert_eq!(fields[2], "indexer");
    assert!(fields[3].starts_with("127.0.0.1:"), "channel: {}", fields[3]);
    wait(&worker).await;
}

#[tokio::test]
async fn spawn_event_then_exit_event() {
    let dir = tempfile::tempdir().unwrap();
    let entry = script(dir.path(), "exit 0\n");
    let worker = sh_launcher(LauncherConfig::default())
        .spawn(entry, NO_ARGS, UtilityProcessOptions::default().with_stdio("ignore"))
        .unwrap();
    let pid = worker.pid().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    worker.on_event(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });

    assert_eq!(wait(&worker).await, ExitInfo::with_code(0));
    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            WorkerEvent::Other {
                tag: "spawn".into(),
                payload: json!({ "pid": pid }),
            },
            WorkerEvent::Exit(ExitInfo::with_code(0)),
        ]
    );
}

#[tokio::test]
async fn terminate_kills_a_running_worker() {
    let dir = tempfile::tempdir().unwrap();
    let entry = script(dir.path(), "exec sleep 30\n");
    let worker = sh_launcher(LauncherConfig::default())
        .spawn(entry, NO_ARGS, UtilityProcessOptions::default().with_stdio("ignore"))
        .unwrap();

    assert!(worker.terminate());
    let info = wait(&worker).await;
    assert_eq!(info, ExitInfo::with_signal(9));
    assert!(!info.success());
    assert!(!worker.terminate());
    assert_eq!(worker.pid(), None);
}

#[tokio::test]
async fn missing_program_is_a_launch_failure() {
    let launcher = Launcher::new(Arc::new(TokioProcessHost::default()));
    let err = launcher
        .spawn("/nonexistent/utilproc-worker", NO_ARGS, piped())
        .unwrap_err();
    match err {
        Error::LaunchFailure(msg) => assert!(msg.contains("/nonexistent/utilproc-worker")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn invalid_options_never_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let entry = script(dir.path(), "exit 0\n");
    let err = sh_launcher(LauncherConfig::default())
        .spawn(
            entry,
            NO_ARGS,
            UtilityProcessOptions::default().with_stdio(["pipe", "pipe", "pipe"]),
        )
        .unwrap_err();
    assert!(
        matches!(err, Error::InvalidArgument(ref msg) if msg == "stdin value other than ignore is not supported."),
        "unexpected error: {err:?}"
    );
}
