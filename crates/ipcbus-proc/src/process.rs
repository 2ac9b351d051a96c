//! Process supervisor
//!
//! Wraps a spawned OS process: relays its standard streams through pipes,
//! optionally records its output, and runs a completion watcher on a
//! dedicated thread. Completion is finalised exactly once, either by the
//! watcher (natural exit), by [`Process::destroy`] (forced) or by
//! [`Process::exit_value`] observing the exit first.

use ipcbus_core::ProcessError;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::multiplex::{Multiplexer, Recorder, Sink};
use crate::pipe::Pipe;
use crate::platform::{current_pid, exit_code, pid_of, terminate};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Extension points called when a process completes.
///
/// Exactly one of the two hooks is called, once, on the thread that
/// finalises the completion.
pub trait ProcessHooks: Send + Sync {
    /// The process exited on its own
    fn on_terminated(&self) {}

    /// The process was forcibly destroyed
    fn on_destroyed(&self) {}
}

/// Hooks doing nothing
pub struct NoHooks;

impl ProcessHooks for NoHooks {}

/// Builder for [`Process`]
pub struct ProcessBuilder {
    command: Vec<String>,
    working_dir: PathBuf,
    env: BTreeMap<String, String>,
    stdin: Option<Box<dyn Read + Send>>,
    stdout: Option<Sink>,
    stderr: Option<Sink>,
    record_stdout: bool,
    record_stderr: bool,
    redirect_stderr: bool,
    debug: bool,
    hooks: Option<Arc<dyn ProcessHooks>>,
}

impl Default for ProcessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBuilder {
    /// Create a builder inheriting a copy of the current environment
    pub fn new() -> Self {
        let env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self {
            command: Vec::new(),
            working_dir: PathBuf::from("."),
            env,
            stdin: None,
            stdout: None,
            stderr: None,
            record_stdout: false,
            record_stderr: false,
            redirect_stderr: false,
            debug: false,
            hooks: None,
        }
    }

    /// Program and arguments
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Directory the process starts in
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set one environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the whole environment
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Feed the process stdin from `source`
    pub fn pipe_stdin(mut self, source: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    /// Echo the process stdout on the console
    pub fn pipe_stdout(self) -> Self {
        self.pipe_stdout_to(std::io::stdout())
    }

    /// Copy the process stdout into `sink`
    pub fn pipe_stdout_to(mut self, sink: impl std::io::Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    /// Echo the process stderr on the console
    pub fn pipe_stderr(self) -> Self {
        self.pipe_stderr_to(std::io::stderr())
    }

    /// Copy the process stderr into `sink`
    pub fn pipe_stderr_to(mut self, sink: impl std::io::Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }

    /// Keep the stdout bytes in memory
    pub fn record_stdout(mut self) -> Self {
        self.record_stdout = true;
        self
    }

    /// Keep the stderr bytes in memory
    pub fn record_stderr(mut self) -> Self {
        self.record_stderr = true;
        self
    }

    /// Merge stderr into stdout; stderr sinks and recording are then unused
    pub fn redirect_stderr(mut self) -> Self {
        self.redirect_stderr = true;
        self
    }

    /// Log the started process
    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Install completion hooks
    pub fn hooks(mut self, hooks: Arc<dyn ProcessHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Spawn the process
    pub fn build(self) -> Result<Process, ProcessError> {
        let Some(program) = self.command.first() else {
            return Err(ProcessError::MissingCommand);
        };
        if !self.working_dir.is_dir() {
            return Err(ProcessError::InvalidWorkingDir {
                path: self.working_dir,
            });
        }
        let command_line = self.command.join(" ");

        let recorded_stdout = self.record_stdout.then(Recorder::new);
        let recorded_stderr = self.record_stderr.then(Recorder::new);

        let stdout_plex = fan_out(self.stdout, recorded_stdout.as_ref());
        let stdout_sink = (!stdout_plex.is_empty()).then(|| Box::new(stdout_plex) as Sink);
        let stderr_sink = if self.redirect_stderr {
            None
        } else {
            let stderr_plex = fan_out(self.stderr, recorded_stderr.as_ref());
            (!stderr_plex.is_empty()).then(|| Box::new(stderr_plex) as Sink)
        };

        let mut command = Command::new(program);
        command
            .args(&self.command[1..])
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped());
        let merged = if self.redirect_stderr {
            let (reader, writer) = std::io::pipe()?;
            command.stdout(writer.try_clone()?).stderr(writer);
            Some(reader)
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        };
        let spawned = command.spawn();
        // Release our copies of the merged write end, or the reader never sees EOF.
        drop(command);
        let mut child = spawned.map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = pid_of(&child);

        let stdout_source: Option<Source> = match merged {
            Some(reader) => Some(Box::new(reader)),
            None => child.stdout.take().map(|s| Box::new(s) as Source),
        };
        let outputs = Outputs {
            stdout_source,
            stdout_sink,
            stderr_sink,
            stderr_merged: self.redirect_stderr,
        };
        let streams = match Streams::attach(&mut child, pid, self.stdin, outputs) {
            Ok(streams) => streams,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        let inner = Arc::new(ProcessInner {
            pid,
            command: self.command,
            working_dir: self.working_dir,
            child: Mutex::new(child),
            running: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            exit: Mutex::new(None),
            completed: Condvar::new(),
            streams,
            recorded_stdout,
            recorded_stderr,
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoHooks)),
        });

        let watcher = inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("process-future@{}", pid))
            .spawn(move || watcher.watch());
        if let Err(e) = spawned {
            inner.kill_and_finish();
            return Err(e.into());
        }

        if self.debug {
            tracing::info!("[{}] Started process {}: {}", current_pid(), pid, command_line);
        }
        Ok(Process { inner })
    }
}

/// Multiplexer over the user sink and the recorder, whichever are set
fn fan_out(sink: Option<Sink>, recorder: Option<&Recorder>) -> Multiplexer {
    let mut plex = Multiplexer::new();
    if let Some(sink) = sink {
        plex.add(sink);
    }
    if let Some(recorder) = recorder {
        plex.add(Box::new(recorder.clone()));
    }
    plex
}

/// Readable end of a child output stream
type Source = Box<dyn Read + Send>;

/// Output wiring decided by the builder
struct Outputs {
    stdout_source: Option<Source>,
    stdout_sink: Option<Sink>,
    stderr_sink: Option<Sink>,
    stderr_merged: bool,
}

/// Standard streams of the child: pipes attached to some, raw handles for the rest
struct Streams {
    stdin_pipe: Mutex<Option<Pipe>>,
    output_pipes: Mutex<Vec<Pipe>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<Source>>,
    stderr: Mutex<Option<ChildStderr>>,
    stdin_piped: bool,
    stdout_piped: bool,
    stderr_piped: bool,
}

impl Streams {
    fn attach(
        child: &mut Child,
        pid: i64,
        stdin_source: Option<Box<dyn Read + Send>>,
        outputs: Outputs,
    ) -> std::io::Result<Self> {
        let mut stdin_pipe = None;
        let mut output_pipes = Vec::new();

        let stdin_piped = stdin_source.is_some();
        if let Some(source) = stdin_source {
            if let Some(stdin) = child.stdin.take() {
                let name = format!("process-pipe-stdin@{}", pid);
                stdin_pipe = Some(Pipe::new(name, source, stdin)?);
            }
        }
        let mut stdout = outputs.stdout_source;
        let stdout_piped = outputs.stdout_sink.is_some();
        if let Some(sink) = outputs.stdout_sink {
            if let Some(source) = stdout.take() {
                let name = format!("process-pipe-stdout@{}", pid);
                output_pipes.push(Pipe::new(name, source, sink)?);
            }
        }
        // A merged stderr has no stream of its own.
        let stderr_piped = outputs.stderr_sink.is_some() || outputs.stderr_merged;
        if let Some(sink) = outputs.stderr_sink {
            if let Some(stderr) = child.stderr.take() {
                let name = format!("process-pipe-stderr@{}", pid);
                output_pipes.push(Pipe::new(name, stderr, sink)?);
            }
        }

        Ok(Self {
            stdin_pipe: Mutex::new(stdin_pipe),
            output_pipes: Mutex::new(output_pipes),
            stdin: Mutex::new(child.stdin.take()),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(child.stderr.take()),
            stdin_piped,
            stdout_piped,
            stderr_piped,
        })
    }

    /// Drain the output pipes, or abandon them when the process was killed
    fn finish(&self, drain: bool) {
        if let Some(pipe) = self.stdin_pipe.lock().take() {
            pipe.close();
        }
        let pipes = std::mem::take(&mut *self.output_pipes.lock());
        for pipe in pipes {
            if drain {
                pipe.wait_for();
            } else {
                pipe.close();
            }
        }
    }
}

struct ProcessInner {
    pid: i64,
    command: Vec<String>,
    working_dir: PathBuf,
    child: Mutex<Child>,
    running: AtomicBool,
    destroyed: AtomicBool,
    finished: AtomicBool,
    exit: Mutex<Option<i32>>,
    completed: Condvar,
    streams: Streams,
    recorded_stdout: Option<Recorder>,
    recorded_stderr: Option<Recorder>,
    hooks: Arc<dyn ProcessHooks>,
}

impl ProcessInner {
    /// Completion watcher loop
    fn watch(&self) {
        while !self.finished.load(Ordering::SeqCst) {
            let status = self.child.lock().try_wait();
            match status {
                Ok(Some(status)) => {
                    self.finish(exit_code(status));
                    break;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    tracing::warn!("Cannot wait for process {}: {}", self.pid, e);
                    self.finish(-1);
                    break;
                }
            }
        }
    }

    /// Record completion; returns whether this call performed it
    fn finish(&self, code: i32) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        let destroyed = self.destroyed.load(Ordering::SeqCst);
        self.streams.finish(!destroyed);
        self.running.store(false, Ordering::SeqCst);

        let hooks = &self.hooks;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if destroyed {
                hooks.on_destroyed()
            } else {
                hooks.on_terminated()
            }
        }));
        if outcome.is_err() {
            tracing::warn!("Completion hook of process {} panicked", self.pid);
        }

        *self.exit.lock() = Some(code);
        self.completed.notify_all();
        true
    }

    /// Force termination unless the process already exited.
    ///
    /// The destroyed flag is raised under the child lock, before the kill, so
    /// whoever finalises the completion picks the matching hook.
    fn kill_and_finish(&self) -> bool {
        let killed = {
            let mut child = self.child.lock();
            match child.try_wait() {
                Ok(Some(_)) => None,
                _ => {
                    let first = !self.destroyed.swap(true, Ordering::SeqCst);
                    if let Err(e) = terminate(&mut child) {
                        tracing::debug!("Termination of process {} failed: {}", self.pid, e);
                    }
                    Some((first, child.wait()))
                }
            }
        };
        match killed {
            Some((first, Ok(status))) => {
                self.finish(exit_code(status));
                first
            }
            Some((first, Err(e))) => {
                tracing::warn!("Cannot reap process {}: {}", self.pid, e);
                self.finish(-1);
                first
            }
            None => false,
        }
    }

    fn await_exit(&self, deadline: Option<Instant>) -> Option<i32> {
        let mut exit = self.exit.lock();
        while exit.is_none() {
            match deadline {
                None => self.completed.wait(&mut exit),
                Some(deadline) => {
                    if self.completed.wait_until(&mut exit, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        *exit
    }
}

/// Handle on a supervised OS process
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    /// Create a builder
    pub fn builder() -> ProcessBuilder {
        ProcessBuilder::new()
    }

    /// OS process id, or [`crate::platform::UNKNOWN_PID`]
    pub fn pid(&self) -> i64 {
        self.inner.pid
    }

    /// Program and arguments
    pub fn command(&self) -> &[String] {
        &self.inner.command
    }

    /// Program and arguments joined by spaces
    pub fn command_line(&self) -> String {
        self.inner.command.join(" ")
    }

    /// Directory the process was started in
    pub fn working_directory(&self) -> &Path {
        &self.inner.working_dir
    }

    /// Whether completion has not been recorded yet
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether the process was forcibly terminated
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Block until the process completed and return its exit code
    pub fn wait_for(&self) -> i32 {
        let mut exit = self.inner.exit.lock();
        loop {
            if let Some(code) = *exit {
                return code;
            }
            self.inner.completed.wait(&mut exit);
        }
    }

    /// Block for at most `timeout`.
    ///
    /// A timeout leaves the process untouched.
    pub fn wait_for_time(&self, timeout: Duration) -> Result<i32, ProcessError> {
        self.inner
            .await_exit(Some(Instant::now() + timeout))
            .ok_or_else(|| ProcessError::timeout(timeout))
    }

    /// Exit code of a process that already exited
    pub fn exit_value(&self) -> Result<i32, ProcessError> {
        if let Some(code) = *self.inner.exit.lock() {
            return Ok(code);
        }
        let status = self.inner.child.lock().try_wait()?;
        match status {
            Some(status) => {
                let code = exit_code(status);
                if self.inner.finish(code) {
                    Ok(code)
                } else {
                    Ok(self.inner.exit.lock().unwrap_or(code))
                }
            }
            None => Err(ProcessError::InvalidState("Process not terminated.")),
        }
    }

    /// Terminate the process and wait for its completion.
    ///
    /// On Unix the process receives SIGTERM; one that ignores it keeps this
    /// call blocked until it exits.
    pub fn destroy(&self) {
        self.cancel();
    }

    /// Like [`Process::destroy`]; returns whether this call killed the process
    pub fn cancel(&self) -> bool {
        let performed = self.inner.kill_and_finish();
        self.inner.await_exit(None);
        performed
    }

    /// Recorded stdout bytes
    pub fn recorded_stdout(&self) -> Result<Vec<u8>, ProcessError> {
        self.recorded(&self.inner.recorded_stdout, "Stdout not recorded.")
            .map(|r| r.bytes())
    }

    /// Recorded stderr bytes
    pub fn recorded_stderr(&self) -> Result<Vec<u8>, ProcessError> {
        self.recorded(&self.inner.recorded_stderr, "Stderr not recorded.")
            .map(|r| r.bytes())
    }

    /// Recorded stdout decoded as UTF-8
    pub fn recorded_stdout_text(&self) -> Result<String, ProcessError> {
        self.recorded(&self.inner.recorded_stdout, "Stdout not recorded.")
            .map(|r| r.text())
    }

    /// Recorded stderr decoded as UTF-8
    pub fn recorded_stderr_text(&self) -> Result<String, ProcessError> {
        self.recorded(&self.inner.recorded_stderr, "Stderr not recorded.")
            .map(|r| r.text())
    }

    fn recorded<'a>(
        &self,
        recorder: &'a Option<Recorder>,
        missing: &'static str,
    ) -> Result<&'a Recorder, ProcessError> {
        let recorder = recorder.as_ref().ok_or(ProcessError::InvalidState(missing))?;
        if self.is_running() {
            return Err(ProcessError::InvalidState("Process not terminated."));
        }
        Ok(recorder)
    }

    /// Raw stdin of the child, when no pipe feeds it
    pub fn take_stdin(&self) -> Result<ChildStdin, ProcessError> {
        let streams = &self.inner.streams;
        self.take_stream(&streams.stdin, streams.stdin_piped, "no stdin stream available")
    }

    /// Raw stdout of the child, when no pipe drains it.
    ///
    /// With stderr redirected this stream carries both outputs.
    pub fn take_stdout(&self) -> Result<Box<dyn Read + Send>, ProcessError> {
        let streams = &self.inner.streams;
        self.take_stream(&streams.stdout, streams.stdout_piped, "no stdout stream available")
    }

    /// Raw stderr of the child, when no pipe drains it
    pub fn take_stderr(&self) -> Result<ChildStderr, ProcessError> {
        let streams = &self.inner.streams;
        self.take_stream(&streams.stderr, streams.stderr_piped, "no stderr stream available")
    }

    fn take_stream<T>(
        &self,
        slot: &Mutex<Option<T>>,
        piped: bool,
        unavailable: &'static str,
    ) -> Result<T, ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::InvalidState("Not running"));
        }
        if piped {
            return Err(ProcessError::InvalidState(unavailable));
        }
        slot.lock()
            .take()
            .ok_or(ProcessError::InvalidState("stream already taken"))
    }
}

impl std::fmt::Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command_line())
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.inner.pid)
            .field("command", &self.inner.command)
            .field("running", &self.is_running())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
