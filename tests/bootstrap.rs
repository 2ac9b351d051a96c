//! Parent/child bootstrap through the `ipcbus-child` boot host

#![cfg(unix)]

use ipcbus::{listener, EventProcess, EventProcessBuilder, ListenerRef, SystemEvent};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn counter() -> (Arc<AtomicUsize>, ListenerRef) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handle = listener(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (count, handle)
}

fn child(entry: &str) -> EventProcessBuilder {
    EventProcess::builder()
        .command([env!("CARGO_BIN_EXE_ipcbus-child")])
        .env("RUST_LOG", "warn")
        .random_port()
        .entry(entry)
}

#[test]
fn test_ping_pong_then_exit() {
    let pongs: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = pongs.clone();
    let (exiting, on_exiting) = counter();
    let (exited, on_exited) = counter();

    let process = child("echo")
        .on(
            "pong",
            listener(move |event| {
                sink.lock().push(event.data().cloned().unwrap_or(Value::Null));
                Ok(())
            }),
        )
        .on(SystemEvent::ProcessExiting.as_str(), on_exiting)
        .on(SystemEvent::ProcessExited.as_str(), on_exited)
        .build()
        .unwrap();

    assert!(process.is_event_bus_connected());
    assert_eq!(process.event_bus_server_host(), Some("localhost"));
    assert!(process.event_bus_server_port().is_some());
    assert_eq!(process.event_bus_id(), std::process::id().to_string());

    process.trigger("ping", Some(json!({"n": 1}))).unwrap();
    assert!(wait_until(|| !pongs.lock().is_empty()));
    assert_eq!(pongs.lock()[0], json!({"n": 1}));

    process.exit(0).unwrap();
    assert_eq!(process.wait_for(), 0);
    assert!(wait_until(|| exited.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| exiting.load(Ordering::SeqCst) == 1));
    assert!(!process.is_event_bus_connected());
}

#[test]
fn test_exit_code_is_forwarded() {
    let process = child("echo").build().unwrap();
    assert!(process.is_event_bus_connected());
    process.exit(7).unwrap();
    assert_eq!(process.wait_for(), 7);
}

#[test]
fn test_worker_outlives_entry_point() {
    let done: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let sink = done.clone();
    let (exiting, on_exiting) = counter();

    let process = child("worker")
        .on(
            "worker.done",
            listener(move |event| {
                *sink.lock() = event.data().cloned();
                Ok(())
            }),
        )
        .on(SystemEvent::ProcessExiting.as_str(), on_exiting)
        .build()
        .unwrap();

    assert!(process.is_event_bus_connected());
    assert!(process.is_running());
    process.trigger("go", Some(json!("job-1"))).unwrap();

    assert_eq!(process.wait_for(), 0);
    assert!(wait_until(|| done.lock().is_some()));
    assert_eq!(*done.lock(), Some(json!("job-1")));
    assert!(wait_until(|| exiting.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_destroy_announces_destroyed() {
    let (destroyed, on_destroyed) = counter();
    let (exited, on_exited) = counter();
    let process = child("echo")
        .on(SystemEvent::ProcessDestroyed.as_str(), on_destroyed)
        .on(SystemEvent::ProcessExited.as_str(), on_exited)
        .build()
        .unwrap();

    process.destroy();
    assert!(process.is_destroyed());
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(exited.load(Ordering::SeqCst), 0);
    assert!(!process.is_event_bus_connected());
}

#[test]
fn test_terminate_signal_announces_exiting() {
    let (exiting, on_exiting) = counter();
    let (exited, on_exited) = counter();
    let process = child("echo")
        .on(SystemEvent::ProcessExiting.as_str(), on_exiting)
        .on(SystemEvent::ProcessExited.as_str(), on_exited)
        .build()
        .unwrap();
    assert!(process.is_event_bus_connected());

    let status = std::process::Command::new("kill")
        .args(["-TERM", &process.pid().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    assert_eq!(process.wait_for(), 143);
    assert!(wait_until(|| exiting.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| exited.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_unknown_entry_falls_back_to_local_bus() {
    let process = child("missing").build().unwrap();

    assert_eq!(process.wait_for(), 1);
    assert!(!process.is_event_bus_connected());
    assert_eq!(process.event_bus_server_port(), None);

    let (pings, on_ping) = counter();
    process.on("ping", on_ping).unwrap();
    process.trigger("ping", None).unwrap();
    assert_eq!(pings.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_entry_exits_with_error() {
    let process = child("fail").record_stderr().build().unwrap();
    assert_eq!(process.wait_for(), 1);
    let stderr = process.recorded_stderr_text().unwrap();
    assert!(stderr.contains("entry point failed on request"), "{}", stderr);
}
