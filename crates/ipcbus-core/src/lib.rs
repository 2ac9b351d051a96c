//! # ipcbus Core
//!
//! Core types, traits, and utilities for ipcbus.
//! Provides the event model, listener registry, the in-process event bus,
//! endpoint configuration and the error types shared by every layer.

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod registry;

pub use bus::{
    ensure_triggerable, generate_bus_id, text, validate_unbind_name, BusOptions, EventBus,
    EventBusBuilder, LocalEventBus,
};

pub use config::{BusConfig, DEFAULT_BIND_ADDRESS, DEFAULT_HOST, DEFAULT_PORT};

pub use error::{BootError, Error, EventBusError, ListenerError, ProcessError, Result};

pub use event::{
    is_reserved_name, validate_event_name, validate_user_event_name, Event, EventData,
    SystemEvent, RESERVED_PREFIX,
};

// Re-export listener API for convenience
pub use listener::{
    listener, same_listener, ErrorPolicy, EventListener, ListenerRef, ListenerResult,
    PrintErrors, RecordErrors, RecordedError, RethrowErrors,
};

pub use registry::{ListenerRegistry, WILDCARD};
