//! Event Bus implementation.
//!
//! Provides the [`EventBus`] trait shared by every bus flavour, the
//! in-process [`LocalEventBus`] and the builder options common to all bus
//! builders.

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::event::{
    is_reserved_name, validate_event_name, validate_user_event_name, Event, EventData,
    SystemEvent,
};
use crate::listener::{invoke, ErrorPolicy, ListenerRef, RethrowErrors};
use crate::registry::{ListenerRegistry, WILDCARD};

/// Addressable publish/subscribe endpoint
pub trait EventBus: Send + Sync {
    /// Unique id of this bus, used as the source of triggered events
    fn id(&self) -> &str;

    /// Register a listener for one event name
    fn on(&self, event: &str, listener: ListenerRef) -> Result<(), EventBusError>;

    /// Register a listener receiving every event
    fn on_all(&self, listener: ListenerRef);

    /// Drop every listener registered for `event`
    fn unbind_event(&self, event: &str) -> Result<(), EventBusError>;

    /// Remove a listener from every event it was registered for
    fn unbind(&self, listener: &ListenerRef);

    /// Remove a listener from one event
    fn unbind_listener(&self, event: &str, listener: &ListenerRef) -> Result<(), EventBusError>;

    /// Trigger a user event.
    ///
    /// Listeners registered for `name` run first, in registration order,
    /// then wildcard listeners. Reserved names are rejected.
    fn trigger(&self, name: &str, data: Option<EventData>) -> Result<(), EventBusError>;

    /// Trigger a process lifecycle event.
    ///
    /// Transport events (`eventbus.*`) are emitted by the bus internals only
    /// and are rejected here.
    fn trigger_system(&self, event: SystemEvent, data: Option<EventData>)
        -> Result<(), EventBusError>;
}

/// Check that a system event may be triggered explicitly
pub fn ensure_triggerable(event: SystemEvent) -> Result<(), EventBusError> {
    if event.is_transport() {
        return Err(EventBusError::reserved(event.as_str()));
    }
    Ok(())
}

/// Validate a name passed to `unbind_event`
pub fn validate_unbind_name(event: &str) -> Result<(), EventBusError> {
    validate_event_name(event)?;
    if is_reserved_name(event) {
        return Err(EventBusError::reserved(event));
    }
    Ok(())
}

/// Generate a random bus id
pub fn generate_bus_id() -> String {
    Uuid::new_v4().to_string()
}

/// In-process event bus
///
/// Dispatch is synchronous: `trigger` returns once every listener has run.
pub struct LocalEventBus {
    id: String,
    error_policy: Arc<dyn ErrorPolicy>,
    listeners: ListenerRegistry,
}

impl LocalEventBus {
    /// Create a builder for a local bus
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Create a bus with no listeners
    pub fn new(id: impl Into<String>, error_policy: Arc<dyn ErrorPolicy>) -> Self {
        Self::with_listeners(id, error_policy, ListenerRegistry::new())
    }

    /// Create a bus seeded with listeners
    pub fn with_listeners(
        id: impl Into<String>,
        error_policy: Arc<dyn ErrorPolicy>,
        listeners: ListenerRegistry,
    ) -> Self {
        Self {
            id: id.into(),
            error_policy,
            listeners,
        }
    }

    /// Deliver an event to local listeners.
    ///
    /// Each listener failure goes through the error policy; dispatch stops
    /// only if the policy returns an error.
    pub fn dispatch(&self, event: &Event) -> Result<(), EventBusError> {
        let buckets: &[&str] = if event.name() == WILDCARD {
            &[WILDCARD]
        } else {
            &[event.name(), WILDCARD]
        };
        for bucket in buckets.iter().copied() {
            for listener in self.listeners.listeners(bucket).iter() {
                if let Err(error) = invoke(listener, event) {
                    self.error_policy.on_error(event, error)?;
                }
            }
        }
        Ok(())
    }

    /// Deliver an internally generated event, logging a propagated failure
    pub fn dispatch_quietly(&self, event: &Event) {
        if let Err(e) = self.dispatch(event) {
            tracing::warn!("Dispatch of {} on bus {} failed: {}", event.name(), self.id, e);
        }
    }

    /// Build an event sourced from this bus
    pub fn event(&self, name: &str, data: Option<EventData>) -> Event {
        Event::new(self.id.clone(), name, data)
    }

    /// The error policy of this bus
    pub fn error_policy(&self) -> Arc<dyn ErrorPolicy> {
        self.error_policy.clone()
    }

    /// The listener registry of this bus
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}

impl EventBus for LocalEventBus {
    fn id(&self) -> &str {
        &self.id
    }

    fn on(&self, event: &str, listener: ListenerRef) -> Result<(), EventBusError> {
        validate_event_name(event)?;
        self.listeners.add(event, listener);
        tracing::debug!("Listener added on {} for '{}'", self.id, event);
        Ok(())
    }

    fn on_all(&self, listener: ListenerRef) {
        self.listeners.add(WILDCARD, listener);
        tracing::debug!("Wildcard listener added on {}", self.id);
    }

    fn unbind_event(&self, event: &str) -> Result<(), EventBusError> {
        validate_unbind_name(event)?;
        self.listeners.remove_event(event);
        Ok(())
    }

    fn unbind(&self, listener: &ListenerRef) {
        self.listeners.remove_listener(listener);
    }

    fn unbind_listener(&self, event: &str, listener: &ListenerRef) -> Result<(), EventBusError> {
        validate_event_name(event)?;
        self.listeners.remove(event, listener);
        Ok(())
    }

    fn trigger(&self, name: &str, data: Option<EventData>) -> Result<(), EventBusError> {
        validate_user_event_name(name)?;
        self.dispatch(&self.event(name, data))
    }

    fn trigger_system(
        &self,
        event: SystemEvent,
        data: Option<EventData>,
    ) -> Result<(), EventBusError> {
        ensure_triggerable(event)?;
        self.dispatch(&self.event(event.as_str(), data))
    }
}

impl std::fmt::Display for LocalEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventBus:{}", self.id)
    }
}

impl std::fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEventBus")
            .field("id", &self.id)
            .field("listeners", &self.listeners)
            .finish()
    }
}

/// Options common to every bus builder
#[derive(Clone)]
pub struct BusOptions {
    id: Option<String>,
    error_policy: Arc<dyn ErrorPolicy>,
    listeners: Vec<(String, ListenerRef)>,
}

impl BusOptions {
    /// Create options using the given default error policy
    pub fn new(error_policy: Arc<dyn ErrorPolicy>) -> Self {
        Self {
            id: None,
            error_policy,
            listeners: Vec::new(),
        }
    }

    /// Set the bus id
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Replace the error policy
    pub fn set_error_policy(&mut self, policy: Arc<dyn ErrorPolicy>) {
        self.error_policy = policy;
    }

    /// Queue a listener for `event`
    pub fn add_listener(&mut self, event: impl Into<String>, listener: ListenerRef) {
        self.listeners.push((event.into(), listener));
    }

    /// Configured id, if any
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Validate the queued listeners and split the options
    pub fn into_parts(
        self,
    ) -> Result<(Option<String>, Arc<dyn ErrorPolicy>, ListenerRegistry), EventBusError> {
        let registry = ListenerRegistry::new();
        for (event, listener) in self.listeners {
            if event != WILDCARD {
                validate_event_name(&event)?;
            }
            registry.add(&event, listener);
        }
        Ok((self.id, self.error_policy, registry))
    }
}

impl Default for BusOptions {
    fn default() -> Self {
        Self::new(Arc::new(RethrowErrors))
    }
}

/// Builder for [`LocalEventBus`]
#[derive(Default)]
pub struct EventBusBuilder {
    options: BusOptions,
}

impl EventBusBuilder {
    /// Create a builder with the rethrowing error policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from prepared options
    pub fn with_options(options: BusOptions) -> Self {
        Self { options }
    }

    /// Identify the bus; a UUID is generated when unset
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

    /// Build the bus
    pub fn build(self) -> Result<LocalEventBus, EventBusError> {
        let (id, policy, registry) = self.options.into_parts()?;
        Ok(LocalEventBus::with_listeners(
            id.unwrap_or_else(generate_bus_id),
            policy,
            registry,
        ))
    }
}

/// Shorthand for a string payload
pub fn text(value: impl Into<String>) -> Option<EventData> {
    Some(Value::String(value.into()))
}
