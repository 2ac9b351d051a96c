#![cfg(unix)]

use ipcbus_core::ProcessError;
use ipcbus_proc::{Process, ProcessHooks, Recorder, FORCED_KILL_EXIT_CODE};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct CountingHooks {
    terminated: AtomicUsize,
    destroyed: AtomicUsize,
}

impl ProcessHooks for CountingHooks {
    fn on_terminated(&self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }

    fn on_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_recorded_output_and_env() {
    let hooks = Arc::new(CountingHooks::default());
    let process = Process::builder()
        .command(["sh", "-c", "sleep 1; echo $GREETING"])
        .env("GREETING", "hello world")
        .record_stdout()
        .record_stderr()
        .hooks(hooks.clone())
        .build()
        .unwrap();

    assert!(process.is_running());
    assert!(matches!(
        process.exit_value(),
        Err(ProcessError::InvalidState(_))
    ));
    assert!(matches!(
        process.recorded_stdout_text(),
        Err(ProcessError::InvalidState(_))
    ));

    assert_eq!(process.wait_for(), 0);
    assert!(!process.is_running());
    assert!(!process.is_destroyed());
    assert_eq!(process.exit_value().unwrap(), 0);
    assert_eq!(process.recorded_stdout_text().unwrap(), "hello world\n");
    assert_eq!(process.recorded_stderr_text().unwrap(), "");
    assert_eq!(hooks.terminated.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.destroyed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unrecorded_stream_is_rejected() {
    let process = Process::builder().command(["true"]).build().unwrap();
    process.wait_for();
    match process.recorded_stdout() {
        Err(ProcessError::InvalidState(msg)) => assert_eq!(msg, "Stdout not recorded."),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_exit_code_is_reported() {
    let process = Process::builder()
        .command(["sh", "-c", "exit 3"])
        .build()
        .unwrap();
    assert_eq!(process.wait_for(), 3);
    assert_eq!(process.exit_value().unwrap(), 3);
}

#[test]
fn test_destroy_runs_destroyed_hook_once() {
    let hooks = Arc::new(CountingHooks::default());
    let process = Arc::new(
        Process::builder()
            .command(["sleep", "30"])
            .hooks(hooks.clone())
            .build()
            .unwrap(),
    );

    let racers: Vec<_> = (0..3)
        .map(|_| {
            let process = process.clone();
            std::thread::spawn(move || process.cancel())
        })
        .collect();
    let killed: usize = racers
        .into_iter()
        .map(|r| usize::from(r.join().unwrap()))
        .sum();

    assert_eq!(killed, 1);
    assert!(process.is_destroyed());
    assert!(!process.is_running());
    assert_eq!(process.wait_for(), FORCED_KILL_EXIT_CODE);
    assert_eq!(process.exit_value().unwrap(), FORCED_KILL_EXIT_CODE);
    assert_eq!(hooks.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.terminated.load(Ordering::SeqCst), 0);
}

#[test]
fn test_destroy_after_exit_is_a_no_op() {
    let hooks = Arc::new(CountingHooks::default());
    let process = Process::builder()
        .command(["true"])
        .hooks(hooks.clone())
        .build()
        .unwrap();
    assert_eq!(process.wait_for(), 0);
    assert!(!process.cancel());
    assert!(!process.is_destroyed());
    assert_eq!(hooks.terminated.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.destroyed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wait_with_timeout() {
    let process = Process::builder()
        .command(["sleep", "30"])
        .build()
        .unwrap();
    let err = process
        .wait_for_time(Duration::from_millis(200))
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(process.is_running());
    process.destroy();
    assert!(!process.is_running());
}

#[test]
fn test_stdin_is_piped_through() {
    let process = Process::builder()
        .command(["cat"])
        .pipe_stdin(Cursor::new(b"line one\nline two\n".to_vec()))
        .record_stdout()
        .build()
        .unwrap();
    assert_eq!(process.wait_for(), 0);
    assert_eq!(
        process.recorded_stdout_text().unwrap(),
        "line one\nline two\n"
    );
}

#[test]
fn test_stderr_redirected_into_stdout() {
    let out = Recorder::new();
    let process = Process::builder()
        .command(["sh", "-c", "echo out; sleep 0.2; echo err 1>&2"])
        .pipe_stdout_to(out.clone())
        .record_stdout()
        .redirect_stderr()
        .build()
        .unwrap();
    assert_eq!(process.wait_for(), 0);
    assert_eq!(out.text(), "out\nerr\n");
    assert_eq!(process.recorded_stdout_text().unwrap(), "out\nerr\n");
    assert!(process.take_stderr().is_err());
}

#[test]
fn test_redirected_stderr_joins_raw_stdout() {
    let process = Process::builder()
        .command(["sh", "-c", "echo out; sleep 0.2; echo err 1>&2"])
        .redirect_stderr()
        .build()
        .unwrap();

    let mut stdout = process.take_stdout().unwrap();
    assert!(matches!(
        process.take_stderr(),
        Err(ProcessError::InvalidState("no stderr stream available"))
    ));
    let mut text = String::new();
    stdout.read_to_string(&mut text).unwrap();
    assert_eq!(text, "out\nerr\n");
    assert_eq!(process.wait_for(), 0);
}

#[test]
fn test_raw_streams() {
    let process = Process::builder()
        .command(["sh", "-c", "read line; echo got $line"])
        .build()
        .unwrap();

    let mut stdin = process.take_stdin().unwrap();
    let mut stdout = process.take_stdout().unwrap();
    assert!(matches!(
        process.take_stdout(),
        Err(ProcessError::InvalidState("stream already taken"))
    ));

    std::io::Write::write_all(&mut stdin, b"ping\n").unwrap();
    drop(stdin);
    let mut text = String::new();
    stdout.read_to_string(&mut text).unwrap();
    assert_eq!(text, "got ping\n");
    assert_eq!(process.wait_for(), 0);
    assert!(matches!(
        process.take_stdin(),
        Err(ProcessError::InvalidState("Not running"))
    ));
}

#[test]
fn test_piped_stream_cannot_be_taken() {
    let process = Process::builder()
        .command(["sleep", "30"])
        .record_stdout()
        .build()
        .unwrap();
    assert!(matches!(
        process.take_stdout(),
        Err(ProcessError::InvalidState("no stdout stream available"))
    ));
    process.destroy();
}
