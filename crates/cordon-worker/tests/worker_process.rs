#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cordon_worker::{Worker, WorkerError, WorkerOptions, WorkerProcess};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

fn fast_options() -> WorkerOptions {
    WorkerOptions {
        rpc_timeout: Some(Duration::from_millis(300)),
        stop_timeout: Duration::from_millis(100),
    }
}

#[test]
fn timeout_destroys_a_hung_worker() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let script = write_script(tmp.path(), "hang", "exec sleep 60");
    let worker =
        WorkerProcess::spawn(&script, tmp.path(), fast_options()).expect("spawn");

    let start = Instant::now();
    let err = worker
        .invoke("ping", vec![], serde_json::Map::new())
        .expect_err("hung worker must time out");
    match err {
        WorkerError::Timeout { command, timeout } => {
            assert_eq!(command, "ping");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(worker.is_dead());
    assert!(worker.is_stopped());
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "teardown took {:?}",
        start.elapsed()
    );

    // The failing call surfaced its error; later calls fail locally.
    let err = worker
        .invoke("ping", vec![], serde_json::Map::new())
        .expect_err("dead worker");
    assert!(matches!(err, WorkerError::Stopped));
}

#[test]
fn exited_child_yields_unavailable() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let script = write_script(tmp.path(), "quit", "exit 0");
    let worker =
        WorkerProcess::spawn(&script, tmp.path(), fast_options()).expect("spawn");

    // Give the child a moment to exit and close its end of the channel.
    std::thread::sleep(Duration::from_millis(100));

    let err = worker
        .invoke("ping", vec![], serde_json::Map::new())
        .expect_err("exited worker");
    assert!(matches!(err, WorkerError::Unavailable), "got {err:?}");
    assert!(worker.is_dead());
}

#[test]
fn stop_kills_an_unresponsive_worker_within_bounds() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let script = write_script(tmp.path(), "hang", "exec sleep 60");
    let worker =
        WorkerProcess::spawn(&script, tmp.path(), fast_options()).expect("spawn");

    let start = Instant::now();
    worker.stop();
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "stop took {:?}",
        start.elapsed()
    );
    assert!(worker.is_stopped());
    assert!(worker.is_dead());

    // stop() is idempotent.
    worker.stop();

    let err = worker
        .invoke("ping", vec![], serde_json::Map::new())
        .expect_err("stopped worker");
    assert!(matches!(err, WorkerError::Stopped));
}
