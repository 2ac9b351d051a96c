//! Parent side of the bootstrap protocol
//!
//! Spawns a child process with the bus connection parameters in its
//! environment, then connects an [`EventBusClient`] to the server the child
//! opens. When the child cannot be reached the process keeps running with a
//! local-only bus; [`EventProcess::is_event_bus_connected`] tells which.

use ipcbus_core::{
    BusConfig, BusOptions, Error, ErrorPolicy, EventBus, EventBusBuilder, EventBusError,
    EventData, ListenerRef, LocalEventBus, PrintErrors, SystemEvent, WILDCARD,
};
use ipcbus_net::{EventBusClient, EventBusClientBuilder, RemoteEventBus};
use serde_json::json;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::platform::{current_pid, minimum_sleep};
use crate::process::{Process, ProcessBuilder, ProcessHooks};

/// Environment variable carrying the port the child listens on
pub const ENV_PORT: &str = ipcbus_core::config::ENV_PORT;

/// Environment variable carrying the address the child binds to
pub const ENV_BIND: &str = ipcbus_core::config::ENV_BIND;

/// Environment variable set when the child should log bus activity
pub const ENV_DEBUG: &str = "IPCBUS_DEBUG";

/// Environment variable naming the entry point the child runs
pub const ENV_ENTRY: &str = "IPCBUS_ENTRY";

/// Connection attempts made before falling back to a local bus
pub const CONNECT_ATTEMPTS: usize = 4;

/// Pause between two connection attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bus of a supervised child: connected, or local after a failed bootstrap
pub enum ProcessBus {
    /// Connected to the child's server
    Connected(EventBusClient),
    /// The child could not be reached
    Local(LocalEventBus),
}

impl ProcessBus {
    fn client(&self) -> Option<&EventBusClient> {
        match self {
            ProcessBus::Connected(client) => Some(client),
            ProcessBus::Local(_) => None,
        }
    }
}

impl Deref for ProcessBus {
    type Target = dyn EventBus;

    fn deref(&self) -> &Self::Target {
        match self {
            ProcessBus::Connected(client) => client,
            ProcessBus::Local(bus) => bus,
        }
    }
}

/// Completion hooks announcing the end of the child on its bus
#[derive(Default)]
struct BusSlot {
    bus: OnceLock<Arc<ProcessBus>>,
}

impl BusSlot {
    fn announce(&self, event: SystemEvent) {
        let Some(bus) = self.bus.get() else {
            return;
        };
        if let Err(e) = bus.trigger_system(event, None) {
            tracing::warn!("Cannot announce {} on {}: {}", event, bus.id(), e);
        }
        if let Some(client) = bus.client() {
            client.close();
        }
    }
}

impl ProcessHooks for BusSlot {
    fn on_terminated(&self) {
        self.announce(SystemEvent::ProcessExited);
    }

    fn on_destroyed(&self) {
        self.announce(SystemEvent::ProcessDestroyed);
    }
}

/// Builder for [`EventProcess`]
pub struct EventProcessBuilder {
    process: ProcessBuilder,
    options: BusOptions,
    port: Option<u16>,
    host: Option<String>,
    entry: Option<String>,
    debug: bool,
}

impl Default for EventProcessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessBuilder {
    /// Create a builder
    pub fn new() -> Self {
        Self {
            process: ProcessBuilder::new(),
            options: BusOptions::new(Arc::new(PrintErrors)),
            port: None,
            host: None,
            entry: None,
            debug: false,
        }
    }

    /// Program and arguments of the child
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process = self.process.command(command);
        self
    }

    /// Directory the child starts in
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.process = self.process.working_dir(dir);
        self
    }

    /// Set one environment variable of the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.process = self.process.env(key, value);
        self
    }

    /// Replace the child environment
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.process = self.process.envs(vars);
        self
    }

    /// Feed the child stdin from `source`
    pub fn pipe_stdin(mut self, source: impl Read + Send + 'static) -> Self {
        self.process = self.process.pipe_stdin(source);
        self
    }

    /// Echo the child stdout on the console
    pub fn pipe_stdout(mut self) -> Self {
        self.process = self.process.pipe_stdout();
        self
    }

    /// Copy the child stdout into `sink`
    pub fn pipe_stdout_to(mut self, sink: impl Write + Send + 'static) -> Self {
        self.process = self.process.pipe_stdout_to(sink);
        self
    }

    /// Echo the child stderr on the console
    pub fn pipe_stderr(mut self) -> Self {
        self.process = self.process.pipe_stderr();
        self
    }

    /// Copy the child stderr into `sink`
    pub fn pipe_stderr_to(mut self, sink: impl Write + Send + 'static) -> Self {
        self.process = self.process.pipe_stderr_to(sink);
        self
    }

    /// Keep the child stdout in memory
    pub fn record_stdout(mut self) -> Self {
        self.process = self.process.record_stdout();
        self
    }

    /// Keep the child stderr in memory
    pub fn record_stderr(mut self) -> Self {
        self.process = self.process.record_stderr();
        self
    }

    /// Merge the child stderr into its stdout
    pub fn redirect_stderr(mut self) -> Self {
        self.process = self.process.redirect_stderr();
        self
    }

    /// Log the started process and ask the child to log its bus activity
    pub fn debug(mut self) -> Self {
        self.process = self.process.debug();
        self.debug = true;
        self
    }

    /// Port the child listens on; checked to be free before spawning
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Let the OS pick a free port for the child
    pub fn random_port(mut self) -> Self {
        self.port = Some(0);
        self
    }

    /// Host the parent connects to
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Entry point the child boots into
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Set the policy handling listener failures on the parent bus
    pub fn on_error(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.options.set_error_policy(policy);
        self
    }

    /// Register a listener before the bus exists, so no event is missed
    pub fn on(mut self, event: impl Into<String>, listener: ListenerRef) -> Self {
        self.options.add_listener(event, listener);
        self
    }

    /// Register a wildcard listener before the bus exists
    pub fn on_all(mut self, listener: ListenerRef) -> Self {
        self.options.add_listener(WILDCARD, listener);
        self
    }

    /// Spawn the child and wire it to the bus
    pub fn build(self) -> Result<EventProcess, Error> {
        let port = select_port(self.port.unwrap_or(0))?;
        let host = match self.host {
            Some(host) => host,
            None => BusConfig::default().host,
        };

        let mut process = self.process.env(ENV_PORT, port.to_string());
        if let Some(entry) = &self.entry {
            process = process.env(ENV_ENTRY, entry.as_str());
        }
        if self.debug {
            process = process.env(ENV_DEBUG, "true");
        }

        let slot = Arc::new(BusSlot::default());
        let process = process.hooks(slot.clone()).build()?;

        let id = current_pid().to_string();
        let bus = match connect(&process, &host, port, &id, &self.options) {
            Some(client) => ProcessBus::Connected(client),
            None => {
                tracing::warn!(
                    "Event bus of process {} unreachable on {}:{}, using a local bus",
                    process.pid(),
                    host,
                    port
                );
                ProcessBus::Local(
                    EventBusBuilder::with_options(self.options)
                        .id(id)
                        .build()?,
                )
            }
        };
        let bus = Arc::new(bus);
        if slot.bus.set(bus.clone()).is_err() {
            tracing::debug!("Bus of process {} already installed", process.pid());
        }
        if !process.is_running() {
            // The child ended while we were connecting; its hook found no bus.
            if let Some(client) = bus.client() {
                client.close();
            }
        }

        Ok(EventProcess { process, bus })
    }
}

/// Verify an explicit port is free, or pick one when `port` is zero
fn select_port(port: u16) -> Result<u16, EventBusError> {
    let socket = TcpListener::bind(("0.0.0.0", port)).map_err(|source| EventBusError::Bind {
        address: format!("0.0.0.0:{}", port),
        source,
    })?;
    Ok(socket.local_addr()?.port())
}

/// Connect to the child, retrying while it is still starting
fn connect(
    process: &Process,
    host: &str,
    port: u16,
    id: &str,
    options: &BusOptions,
) -> Option<EventBusClient> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        if !process.is_running() {
            break;
        }
        let result = EventBusClientBuilder::with_options(options.clone())
            .id(id)
            .connect(host, port)
            .build();
        match result {
            Ok(client) => return Some(client),
            Err(e) => {
                tracing::debug!(
                    "Attempt {}/{} to reach process {} failed: {}",
                    attempt,
                    CONNECT_ATTEMPTS,
                    process.pid(),
                    e
                );
                if attempt < CONNECT_ATTEMPTS {
                    minimum_sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
    }
    None
}

/// Supervised child process wired to an event bus
pub struct EventProcess {
    process: Process,
    bus: Arc<ProcessBus>,
}

impl EventProcess {
    /// Create a builder
    pub fn builder() -> EventProcessBuilder {
        EventProcessBuilder::new()
    }

    /// The supervised process
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Bus shared with the child
    pub fn bus(&self) -> &dyn EventBus {
        &**self.bus
    }

    /// Whether the bus is connected to the child
    pub fn is_event_bus_connected(&self) -> bool {
        self.bus.client().is_some_and(|client| !client.is_closed())
    }

    /// Id of the parent side bus
    pub fn event_bus_id(&self) -> &str {
        self.bus.id()
    }

    /// Host of the child bus server, when connected
    pub fn event_bus_server_host(&self) -> Option<&str> {
        self.bus.client().map(|client| client.server_host())
    }

    /// Port of the child bus server, when connected
    pub fn event_bus_server_port(&self) -> Option<u16> {
        self.bus.client().map(|client| client.server_port())
    }

    /// Ask the child to exit with `code`
    pub fn exit(&self, code: i32) -> Result<(), EventBusError> {
        self.bus
            .trigger_system(SystemEvent::ProcessExit, Some(json!(code)))
    }

    /// Register a listener for an event
    pub fn on(&self, event: &str, listener: ListenerRef) -> Result<(), EventBusError> {
        self.bus.on(event, listener)
    }

    /// Register a listener for all events
    pub fn on_all(&self, listener: ListenerRef) {
        self.bus.on_all(listener)
    }

    /// Drop every listener registered for `event`
    pub fn unbind_event(&self, event: &str) -> Result<(), EventBusError> {
        self.bus.unbind_event(event)
    }

    /// Remove a listener everywhere
    pub fn unbind(&self, listener: &ListenerRef) {
        self.bus.unbind(listener)
    }

    /// Remove a listener from one event
    pub fn unbind_listener(&self, event: &str, listener: &ListenerRef) -> Result<(), EventBusError> {
        self.bus.unbind_listener(event, listener)
    }

    /// Trigger an event on both sides
    pub fn trigger(&self, name: &str, data: Option<EventData>) -> Result<(), EventBusError> {
        self.bus.trigger(name, data)
    }
}

impl Deref for EventProcess {
    type Target = Process;

    fn deref(&self) -> &Process {
        &self.process
    }
}

impl std::fmt::Display for EventProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.process.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_port_must_be_free() {
        let taken = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(matches!(
            select_port(port),
            Err(EventBusError::Bind { .. })
        ));
    }

    #[test]
    fn test_random_port_is_picked() {
        let port = select_port(0).unwrap();
        assert_ne!(port, 0);
        assert_eq!(select_port(port).unwrap(), port);
    }

    #[test]
    fn test_missing_command_is_reported() {
        let result = EventProcess::builder().random_port().build();
        assert!(matches!(
            result,
            Err(Error::Process(ipcbus_core::ProcessError::MissingCommand))
        ));
    }
}
