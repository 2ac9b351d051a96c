//! Child side of the bootstrap protocol
//!
//! A program started through [`EventProcess`](crate::EventProcess) registers
//! its entry points on a [`Boot`] and calls [`Boot::run`]. The boot reads the
//! bus parameters from the environment, opens an [`EventBusServer`] for the
//! parent to connect to, and runs the requested entry point with access to
//! that bus.
//!
//! `process.exit` from the parent terminates the child with the requested
//! code. `process.exiting` is announced once before the child goes away,
//! whatever the reason: entry point return or panic, `process.exit`, or a
//! termination signal (SIGTERM, SIGINT, SIGQUIT) caught by [`Boot::run`].

use ipcbus_core::{listener, BootError, EventBus, SystemEvent, DEFAULT_BIND_ADDRESS};
use ipcbus_net::EventBusServer;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use crate::event_process::{ENV_BIND, ENV_DEBUG, ENV_ENTRY, ENV_PORT};
use crate::platform::current_pid;

/// Entry point run by the child once its bus is up
pub type EntryPoint = Box<dyn Fn(&BootContext) -> anyhow::Result<()> + Send + Sync>;

/// What an entry point sees of the bootstrapped child
pub struct BootContext {
    bus: Arc<EventBusServer>,
    args: Vec<String>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BootContext {
    /// Bus the parent is connected to
    pub fn bus(&self) -> &EventBusServer {
        &self.bus
    }

    /// Shared handle to the bus, for listeners and workers
    pub fn bus_handle(&self) -> Arc<EventBusServer> {
        self.bus.clone()
    }

    /// Program arguments after the program name
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Run `work` on a named thread; the boot waits for it before exiting
    pub fn spawn<F>(&self, name: impl Into<String>, work: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.into()).spawn(work)?;
        self.workers.lock().push(handle);
        Ok(())
    }

    fn join_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                tracing::error!("Worker {} panicked", name);
            }
        }
    }
}

/// One-shot `process.exiting` announcement
#[derive(Default)]
struct ExitSignal {
    fired: AtomicBool,
    bus: OnceLock<Weak<EventBusServer>>,
}

impl ExitSignal {
    fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(bus) = self.bus.get().and_then(Weak::upgrade) else {
            return;
        };
        let pid = current_pid();
        if let Err(e) = bus.trigger_system(SystemEvent::ProcessExiting, Some(json!(pid))) {
            tracing::warn!("Cannot announce exit of process {}: {}", pid, e);
        }
    }
}

/// Fires the exit signal when the entry point unwinds
struct ExitGuard(Arc<ExitSignal>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// Announce `process.exiting`, then exit, on the first termination signal
#[cfg(unix)]
fn watch_termination(signal: Arc<ExitSignal>) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT])?;
    thread::Builder::new()
        .name("termination-watch".to_string())
        .spawn(move || {
            if let Some(received) = signals.forever().next() {
                tracing::debug!("Received signal {}", received);
                signal.fire();
                std::process::exit(128 + received);
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
fn watch_termination(_signal: Arc<ExitSignal>) -> std::io::Result<()> {
    Ok(())
}

/// Child bootstrap: entry point registry and runner
#[derive(Default)]
pub struct Boot {
    entries: BTreeMap<String, EntryPoint>,
    args: Vec<String>,
}

impl Boot {
    /// Create an empty boot
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point under `name`
    pub fn entry<F>(mut self, name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&BootContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Box::new(entry));
        self
    }

    /// Arguments handed to the entry point
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Names of the registered entry points
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Boot from the process environment.
    ///
    /// Installs process-wide handlers for SIGTERM, SIGINT and SIGQUIT that
    /// announce `process.exiting` and exit with `128 + signal`.
    pub fn run(self) -> Result<(), BootError> {
        self.boot(|key| std::env::var(key).ok(), true)
    }

    /// Boot with `lookup` standing in for the environment.
    ///
    /// No signal handlers are installed.
    pub fn run_with<F>(self, lookup: F) -> Result<(), BootError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.boot(lookup, false)
    }

    fn boot<F>(self, lookup: F, handle_signals: bool) -> Result<(), BootError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = lookup(ENV_ENTRY)
            .filter(|name| !name.is_empty())
            .ok_or(BootError::MissingEntryPoint)?;
        let entry = self
            .entries
            .get(&name)
            .ok_or_else(|| BootError::UnknownEntryPoint { name: name.clone() })?;

        let port = match lookup(ENV_PORT).filter(|p| !p.is_empty()) {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .map_err(|_| BootError::InvalidEnvironment {
                    key: ENV_PORT.to_string(),
                    value,
                })?,
            None => 0,
        };
        let bind = lookup(ENV_BIND)
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let debug = lookup(ENV_DEBUG).is_some_and(|d| d.eq_ignore_ascii_case("true"));

        let signal = Arc::new(ExitSignal::default());
        if handle_signals {
            watch_termination(signal.clone())?;
        }

        let pid = current_pid();
        let bus = Arc::new(
            EventBusServer::builder()
                .id(pid.to_string())
                .bind(bind)
                .listen(port)
                .build()?,
        );
        if debug {
            tracing::info!(
                "[{}] Event bus {} listening on port {}, entry {}",
                pid,
                bus.id(),
                bus.server_port(),
                name
            );
        }

        let _ = signal.bus.set(Arc::downgrade(&bus));
        let on_exit = signal.clone();
        bus.on(
            SystemEvent::ProcessExit.as_str(),
            listener(move |event| {
                let code: i32 = event.data_or(0);
                tracing::debug!("Exit requested with code {}", code);
                on_exit.fire();
                std::process::exit(code);
            }),
        )?;
        let context = BootContext {
            bus,
            args: self.args,
            workers: Mutex::new(Vec::new()),
        };
        // Declared after the context so it runs while the bus is still alive.
        let _guard = ExitGuard(signal.clone());
        let result = entry(&context);
        context.join_workers();
        signal.fire();

        result.map_err(|e| BootError::Entry(e.into()))
    }
}
