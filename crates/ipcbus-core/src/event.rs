//! Event type and event name rules.
//!
//! An [`Event`] is an immutable named message carrying the id of the bus it
//! was triggered on, a millisecond timestamp and an optional JSON payload.
//! Names starting with `eventbus.` and the `process.*` lifecycle names are
//! reserved for events the system generates itself, see [`SystemEvent`].

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventBusError;

/// Prefix of transport-level system events.
pub const RESERVED_PREFIX: &str = "eventbus.";

/// Event payload type.
pub type EventData = Value;

/// Events generated by the system rather than by users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEvent {
    /// Wire envelope wrapping a relayed event.
    Envelope,
    /// A peer connected to a server.
    ClientConnect,
    /// A client connection was closed.
    ClientDisconnect,
    /// A client failed to read from its connection.
    ClientError,
    /// A server stopped listening.
    ServerClose,
    /// Request for the child process to exit.
    ProcessExit,
    /// The child process is about to exit.
    ProcessExiting,
    /// The child process terminated on its own.
    ProcessExited,
    /// The child process was forcibly destroyed.
    ProcessDestroyed,
}

impl SystemEvent {
    /// All system events.
    pub const ALL: [SystemEvent; 9] = [
        SystemEvent::Envelope,
        SystemEvent::ClientConnect,
        SystemEvent::ClientDisconnect,
        SystemEvent::ClientError,
        SystemEvent::ServerClose,
        SystemEvent::ProcessExit,
        SystemEvent::ProcessExiting,
        SystemEvent::ProcessExited,
        SystemEvent::ProcessDestroyed,
    ];

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemEvent::Envelope => "eventbus.event",
            SystemEvent::ClientConnect => "eventbus.client.connect",
            SystemEvent::ClientDisconnect => "eventbus.client.disconnect",
            SystemEvent::ClientError => "eventbus.client.error",
            SystemEvent::ServerClose => "eventbus.server.close",
            SystemEvent::ProcessExit => "process.exit",
            SystemEvent::ProcessExiting => "process.exiting",
            SystemEvent::ProcessExited => "process.exited",
            SystemEvent::ProcessDestroyed => "process.destroyed",
        }
    }

    /// Look up a system event by name.
    pub fn from_name(name: &str) -> Option<SystemEvent> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }

    /// Transport events are only ever emitted by the bus internals.
    pub fn is_transport(&self) -> bool {
        self.as_str().starts_with(RESERVED_PREFIX)
    }
}

impl std::fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check if a name is reserved for system events
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || SystemEvent::from_name(name).is_some()
}

/// Validate a name used to register or unbind listeners.
pub fn validate_event_name(name: &str) -> Result<(), EventBusError> {
    if name.is_empty() {
        return Err(EventBusError::InvalidEventName);
    }
    Ok(())
}

/// Validate a name passed to the public `trigger` API.
pub fn validate_user_event_name(name: &str) -> Result<(), EventBusError> {
    validate_event_name(name)?;
    if is_reserved_name(name) {
        return Err(EventBusError::reserved(name));
    }
    Ok(())
}

/// Immutable event delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    source: String,
    name: String,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<EventData>,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(source: impl Into<String>, name: impl Into<String>, data: Option<EventData>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            timestamp: Utc::now().timestamp_millis(),
            data,
        }
    }

    /// Create a system event
    pub fn system(source: impl Into<String>, event: SystemEvent, data: Option<EventData>) -> Self {
        Self::new(source, event.as_str(), data)
    }

    /// Id of the bus the event was triggered on
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Event name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation time in milliseconds since the Unix epoch
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Raw payload
    pub fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }

    /// Consume the event and return its payload
    pub fn into_data(self) -> Option<EventData> {
        self.data
    }

    /// Decode the payload into a concrete type.
    ///
    /// Returns `None` when there is no payload or it does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Decode the payload, falling back to `default`
    pub fn data_or<T: DeserializeOwned>(&self, default: T) -> T {
        self.data_as().unwrap_or(default)
    }

    /// Whether this event was triggered by user code
    pub fn is_user_event(&self) -> bool {
        !is_reserved_name(&self.name)
    }

    /// Match against a system event
    pub fn is(&self, event: SystemEvent) -> bool {
        self.name == event.as_str()
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event{{name='{}', source={}, data=", self.name, self.source)?;
        match &self.data {
            Some(Value::String(s)) => write!(f, "{}", s)?,
            Some(v) => write!(f, "{}", v)?,
            None => write!(f, "null")?,
        }
        write!(f, "}}")
    }
}
