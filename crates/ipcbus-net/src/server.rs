//! Remote event bus server
//!
//! A local bus bound to a listening socket. Each accepted connection becomes
//! an [`EventBusClient`] whose received events are relayed into the server's
//! own dispatch. Events triggered on the server are dispatched locally, then
//! sent to every connected client.

use ipcbus_core::{
    ensure_triggerable, listener, validate_user_event_name, BusConfig, BusOptions, ErrorPolicy,
    Event, EventBus, EventBusError, EventData, ListenerRef, ListenerRegistry, LocalEventBus,
    PrintErrors, SystemEvent, WILDCARD,
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::client::EventBusClient;
use crate::remote::RemoteEventBus;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

struct ServerInner {
    bus: LocalEventBus,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    clients: RwLock<Vec<Arc<EventBusClient>>>,
    trigger_lock: ReentrantMutex<()>,
}

impl ServerInner {
    fn is_closed(&self) -> bool {
        self.listener.lock().is_none()
    }

    /// Dispatch locally, then forward to a snapshot of the connected clients
    fn broadcast(&self, event: &Event) -> Result<(), EventBusError> {
        let _serial = self.trigger_lock.lock();
        self.bus.dispatch(event)?;
        let clients = self.clients.read().clone();
        for client in clients {
            client.send_remote(event);
        }
        Ok(())
    }

    fn remove_client(&self, id: &str) {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|c| c.id() != id);
        if clients.len() != before {
            tracing::debug!("Client {} removed from {}", id, self.bus.id());
        }
    }

    fn close(&self) {
        let listener = self.listener.lock().take();
        if listener.is_none() {
            return;
        }
        drop(listener);

        // The acceptor blocks in accept() on its own handle; wake it up.
        if let Err(e) = TcpStream::connect_timeout(&wake_address(self.local_addr), WAKE_TIMEOUT)
        {
            tracing::debug!("Could not wake acceptor of {}: {}", self.bus.id(), e);
        }

        let clients = std::mem::take(&mut *self.clients.write());
        for client in clients {
            client.close();
        }
        tracing::debug!("Server {} closed", self.bus.id());
        self.bus.dispatch_quietly(&Event::system(
            self.bus.id(),
            SystemEvent::ServerClose,
            None,
        ));
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    if !self.is_closed() {
                        tracing::warn!("Accept failed on {}: {}", self.bus.id(), e);
                    }
                    break;
                }
            };
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.register(stream, peer) {
                tracing::warn!("Cannot register client {} on {}: {}", peer, self.bus.id(), e);
            }
        }
        tracing::debug!("Acceptor of {} stopped", self.bus.id());
    }

    fn register(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<(), EventBusError> {
        let id = peer.to_string();
        let listeners = ListenerRegistry::new();
        listeners.add(WILDCARD, relay(Arc::downgrade(self)));
        let client = {
            // Tracked before its reader runs, so replies to its first events reach it.
            let mut clients = self.clients.write();
            let client = Arc::new(EventBusClient::start(
                stream,
                id.clone(),
                self.bus.error_policy(),
                listeners,
                None,
            )?);
            clients.push(client.clone());
            client
        };
        // The connection may already have dropped before it was tracked.
        if client.is_closed() {
            self.remove_client(&id);
        }

        tracing::debug!("Client {} connected to {}", id, self.bus.id());
        self.bus.dispatch_quietly(&Event::system(
            self.bus.id(),
            SystemEvent::ClientConnect,
            Some(EventData::String(id)),
        ));
        Ok(())
    }
}

/// Listener relaying a connection's events into the server dispatch
fn relay(server: Weak<ServerInner>) -> ListenerRef {
    listener(move |event| {
        let Some(server) = server.upgrade() else {
            return Ok(());
        };
        if event.is(SystemEvent::ClientDisconnect) {
            server.remove_client(event.source());
        }
        server.bus.dispatch(event)?;
        Ok(())
    })
}

/// Address used to reach a listening socket from this host
fn wake_address(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

/// Event bus accepting remote clients
pub struct EventBusServer {
    inner: Arc<ServerInner>,
}

impl EventBusServer {
    /// Create a builder for a server
    pub fn builder() -> EventBusServerBuilder {
        EventBusServerBuilder::new()
    }

    /// Address the server is bound to
    pub fn server_host(&self) -> String {
        self.inner.local_addr.ip().to_string()
    }

    /// Port the server listens on
    pub fn server_port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Number of currently connected clients
    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }
}

impl EventBus for EventBusServer {
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
        self.inner.broadcast(&self.inner.bus.event(name, data))
    }

    fn trigger_system(
        &self,
        event: SystemEvent,
        data: Option<EventData>,
    ) -> Result<(), EventBusError> {
        ensure_triggerable(event)?;
        self.inner.broadcast(&self.inner.bus.event(event.as_str(), data))
    }
}

impl RemoteEventBus for EventBusServer {
    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn server_port(&self) -> u16 {
        self.inner.local_addr.port()
    }
}

impl Drop for EventBusServer {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Display for EventBusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventBusServer:{}", self.id())
    }
}

impl std::fmt::Debug for EventBusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusServer")
            .field("id", &self.id())
            .field("local_addr", &self.inner.local_addr)
            .field("clients", &self.client_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for [`EventBusServer`]
pub struct EventBusServerBuilder {
    options: BusOptions,
    bind_address: Option<String>,
    port: Option<u16>,
    config: Option<BusConfig>,
}

impl Default for EventBusServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBusServerBuilder {
    /// Create a builder logging listener failures
    pub fn new() -> Self {
        Self {
            options: BusOptions::new(Arc::new(PrintErrors)),
            bind_address: None,
            port: None,
            config: None,
        }
    }

    /// Identify the bus; defaults to the bound socket address
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

    /// Bind to a specific local address
    pub fn bind(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }

    /// Listen on `port`
    pub fn listen(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Listen on a port picked by the OS
    pub fn listen_random(self) -> Self {
        self.listen(0)
    }

    /// Endpoint defaults used for anything not set explicitly
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Bind the socket and start the acceptor thread
    pub fn build(self) -> Result<EventBusServer, EventBusError> {
        let config = match self.config {
            Some(config) => config,
            None if self.bind_address.is_some() && self.port.is_some() => BusConfig::default(),
            None => BusConfig::from_env()?,
        };
        let address = self.bind_address.unwrap_or(config.bind_address);
        let port = self.port.unwrap_or(config.port);

        let listener = TcpListener::bind((address.as_str(), port)).map_err(|source| {
            EventBusError::Bind {
                address: format!("{}:{}", address, port),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;
        let acceptor = listener.try_clone()?;

        let (id, policy, listeners) = self.options.into_parts()?;
        let id = id.unwrap_or_else(|| local_addr.to_string());
        let inner = Arc::new(ServerInner {
            bus: LocalEventBus::with_listeners(id.clone(), policy, listeners),
            listener: Mutex::new(Some(listener)),
            local_addr,
            clients: RwLock::new(Vec::new()),
            trigger_lock: ReentrantMutex::new(()),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker = inner.clone();
        thread::Builder::new()
            .name(format!("client-acceptor@{}", id))
            .spawn(move || {
                let _ = ready_tx.send(());
                worker.accept_loop(acceptor);
            })?;
        if ready_rx.recv().is_err() {
            inner.close();
            return Err(EventBusError::Io(std::io::Error::other(
                "acceptor thread exited before start",
            )));
        }

        tracing::debug!("Server {} listening on {}", id, local_addr);
        Ok(EventBusServer { inner })
    }
}
