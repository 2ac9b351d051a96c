//! Remote event bus client
//!
//! A local bus bound to one socket connection. A background reader thread
//! decodes inbound envelopes and dispatches the relayed events locally;
//! outbound events are dispatched locally first, then written to the socket.

use ipcbus_core::{
    ensure_triggerable, validate_user_event_name, BusConfig, BusOptions, ErrorPolicy, Event,
    EventBus, EventBusError, EventData, ListenerRef, ListenerRegistry, LocalEventBus,
    PrintErrors, SystemEvent, WILDCARD,
};
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::remote::RemoteEventBus;
use crate::wire::{self, EventReader};

pub(crate) struct ClientInner {
    bus: LocalEventBus,
    socket: Mutex<Option<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    server_host: String,
    server_port: u16,
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.socket.lock().is_none()
    }

    /// Release the socket; only the caller that takes it emits the disconnect
    fn close(&self) {
        let socket = self.socket.lock().take();
        if let Some(socket) = socket {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                tracing::debug!("Socket shutdown on {} failed: {}", self.bus.id(), e);
            }
            tracing::debug!("Client {} disconnected", self.bus.id());
            self.bus.dispatch_quietly(&Event::system(
                self.bus.id(),
                SystemEvent::ClientDisconnect,
                None,
            ));
        }
    }

    /// Best-effort write; a failed write closes the connection
    fn send_remote(&self, event: &Event) {
        if self.is_closed() {
            return;
        }
        let result = {
            let mut writer = self.writer.lock();
            wire::write_event(&mut *writer, self.bus.id(), event)
        };
        if let Err(e) = result {
            tracing::warn!("Failed to send {} from {}: {}", event.name(), self.bus.id(), e);
            self.close();
        }
    }

    fn publish(&self, event: &Event) -> Result<(), EventBusError> {
        self.bus.dispatch(event)?;
        self.send_remote(event);
        Ok(())
    }

    fn read_loop(&self, reader: TcpStream) {
        for next in EventReader::new(BufReader::new(reader)) {
            match next {
                Ok(envelope) => match wire::open_envelope(envelope) {
                    Some(event) => self.bus.dispatch_quietly(&event),
                    None => tracing::debug!("Ignoring unexpected message on {}", self.bus.id()),
                },
                Err(e) => {
                    if !self.is_closed() {
                        tracing::warn!("Read failure on {}: {}", self.bus.id(), e);
                        self.bus.dispatch_quietly(&Event::system(
                            self.bus.id(),
                            SystemEvent::ClientError,
                            Some(EventData::String(e.to_string())),
                        ));
                    }
                    break;
                }
            }
        }
        self.close();
    }
}

/// Event bus connected to a remote peer
pub struct EventBusClient {
    inner: Arc<ClientInner>,
}

impl EventBusClient {
    /// Create a builder for a client
    pub fn builder() -> EventBusClientBuilder {
        EventBusClientBuilder::new()
    }

    /// Wrap an established connection and start its reader thread.
    ///
    /// Returns once the reader is live.
    pub(crate) fn start(
        stream: TcpStream,
        id: String,
        error_policy: Arc<dyn ErrorPolicy>,
        listeners: ListenerRegistry,
        server_host: Option<String>,
    ) -> Result<Self, EventBusError> {
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Cannot disable Nagle on {}: {}", id, e);
        }

        let inner = Arc::new(ClientInner {
            bus: LocalEventBus::with_listeners(id.clone(), error_policy, listeners),
            socket: Mutex::new(Some(stream)),
            writer: Mutex::new(BufWriter::new(writer)),
            server_host: server_host.unwrap_or_else(|| peer.ip().to_string()),
            server_port: peer.port(),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker = inner.clone();
        thread::Builder::new()
            .name(format!("reader@{}", id))
            .spawn(move || {
                let _ = ready_tx.send(());
                worker.read_loop(reader);
            })?;
        if ready_rx.recv().is_err() {
            // Never announced as connected, so no disconnect either.
            if let Some(socket) = inner.socket.lock().take() {
                let _ = socket.shutdown(Shutdown::Both);
            }
            return Err(EventBusError::Io(std::io::Error::other(
                "reader thread exited before start",
            )));
        }

        tracing::debug!("Client {} connected to {}", id, peer);
        Ok(Self { inner })
    }

    /// Host of the remote peer
    pub fn server_host(&self) -> &str {
        &self.inner.server_host
    }

    /// Port of the remote peer
    pub fn server_port(&self) -> u16 {
        self.inner.server_port
    }

    /// Write an event to the peer without dispatching it locally
    pub(crate) fn send_remote(&self, event: &Event) {
        self.inner.send_remote(event);
    }
}

impl EventBus for EventBusClient {
    fn id(&self) -> &str {
        self.inner.bus.id()
    }

    fn on(&self, event: &str, listener: ListenerRef) -> Result<(), EventBusError> {
        self.inner.bus.on(event, listener)
    }

    fn on_all(&self, listener: ListenerRef) {
        self.inner.bus.on_all(listener)
    }

    fn unbind_event(&self, event: &str) -> Result<(), EventBusError> {
        self.inner.bus.unbind_event(event)
    }

    fn unbind(&self, listener: &ListenerRef) {
        self.inner.bus.unbind(listener)
    }

    fn unbind_listener(&self, event: &str, listener: &ListenerRef) -> Result<(), EventBusError> {
        self.inner.bus.unbind_listener(event, listener)
    }

    fn trigger(&self, name: &str, data: Option<EventData>) -> Result<(), EventBusError> {
        validate_user_event_name(name)?;
        self.inner.publish(&self.inner.bus.event(name, data))
    }

    fn trigger_system(
        &self,
        event: SystemEvent,
        data: Option<EventData>,
    ) -> Result<(), EventBusError> {
        ensure_triggerable(event)?;
        self.inner.publish(&self.inner.bus.event(event.as_str(), data))
    }
}

impl RemoteEventBus for EventBusClient {
    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn server_port(&self) -> u16 {
        self.inner.server_port
    }
}

impl Drop for EventBusClient {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Display for EventBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventBusClient:{}", self.id())
    }
}

impl std::fmt::Debug for EventBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusClient")
            .field("id", &self.id())
            .field("server_host", &self.inner.server_host)
            .field("server_port", &self.inner.server_port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for [`EventBusClient`]
pub struct EventBusClientBuilder {
    options: BusOptions,
    host: Option<String>,
    port: Option<u16>,
    config: Option<BusConfig>,
}

impl Default for EventBusClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBusClientBuilder {
    /// Create a builder logging listener failures
    pub fn new() -> Self {
        Self {
            options: BusOptions::new(Arc::new(PrintErrors)),
            host: None,
            port: None,
            config: None,
        }
    }

    /// Start from prepared options
    pub fn with_options(options: BusOptions) -> Self {
        Self {
            options,
            ..Self::new()
        }
    }

    /// Identify the bus; defaults to the local socket address
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.options.set_id(id);
        self
    }

    /// Set the policy handling listener failures
    pub fn on_error(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.options.set_error_policy(policy);
        self
    }

    /// Register a listener for an event
    pub fn on(mut self, event: impl Into<String>, listener: ListenerRef) -> Self {
        self.options.add_listener(event, listener);
        self
    }

    /// Register a listener for all events
    pub fn on_all(mut self, listener: ListenerRef) -> Self {
        self.options.add_listener(WILDCARD, listener);
        self
    }

    /// Connect to `host:port`
    pub fn connect(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    /// Connect to the configured host on `port`
    pub fn connect_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Endpoint defaults used for anything not set explicitly
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Connect and start the reader thread
    pub fn build(self) -> Result<EventBusClient, EventBusError> {
        let config = match self.config {
            Some(config) => config,
            None if self.host.is_some() && self.port.is_some() => BusConfig::default(),
            None => BusConfig::from_env()?,
        };
        let host = self.host.unwrap_or(config.host);
        let port = self.port.unwrap_or(config.port);
        let address = format!("{}:{}", host, port);

        let stream =
            TcpStream::connect((host.as_str(), port)).map_err(|source| EventBusError::Connect {
                address: address.clone(),
                source,
            })?;
        let (id, policy, listeners) = self.options.into_parts()?;
        let id = match id {
            Some(id) => id,
            None => stream.local_addr()?.to_string(),
        };
        EventBusClient::start(stream, id, policy, listeners, Some(host))
    }
}
