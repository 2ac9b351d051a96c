//! Error handling for ipcbus
//!
//! Provides error types for every layer of the system:
//! - Event bus errors (event names, listener failures, socket setup)
//! - Process errors (configuration, spawning, lifecycle state, timeouts)
//! - Boot errors (child side of the bootstrap protocol)
//!
//! All error types use `thiserror` for ergonomic error handling.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error raised by an event listener.
///
/// Listeners may fail with any error type; the bus hands the boxed error to
/// its error policy.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Event bus error type
///
/// Represents errors related to event names, listener dispatch and the
/// socket transport of remote buses.
#[derive(Error, Debug)]
pub enum EventBusError {
    /// Event name is empty
    #[error("Event name must not be empty")]
    InvalidEventName,

    /// Event name belongs to the reserved system namespace
    #[error("Reserved event name: {name}")]
    ReservedEventName {
        /// The rejected event name.
        name: String,
    },

    /// A listener failed and the error policy propagated it
    #[error("Listener failed on event '{event}': {source}")]
    Listener {
        /// Name of the event being dispatched.
        event: String,
        /// The listener failure.
        #[source]
        source: ListenerError,
    },

    /// Listening socket could not be bound
    #[error("Cannot bind on {address} : {source}")]
    Bind {
        /// The address that could not be bound.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Connection to a remote bus could not be established
    #[error("Bad endpoint: {address} : {source}")]
    Connect {
        /// The endpoint that refused the connection.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Event could not be encoded for the wire
    #[error("Cannot encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// Bus configuration is invalid
    #[error("Invalid bus configuration: {reason}")]
    InvalidConfig {
        /// The reason the configuration is invalid.
        reason: String,
    },

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EventBusError {
    /// Create a reserved-name error
    pub fn reserved(name: impl Into<String>) -> Self {
        EventBusError::ReservedEventName { name: name.into() }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        EventBusError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Process error type
///
/// Represents errors related to spawning and supervising a child process.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// No command was configured
    #[error("Missing command")]
    MissingCommand,

    /// Working directory does not exist or is not a directory
    #[error("Invalid working directory: {}", path.display())]
    InvalidWorkingDir {
        /// The rejected directory.
        path: PathBuf,
    },

    /// The OS refused to start the process
    #[error("Unable to start {command}: {source}")]
    Spawn {
        /// The command line that failed to start.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Operation is not valid in the current process state
    #[error("{0}")]
    InvalidState(&'static str),

    /// Waiting for completion timed out
    #[error("Process did not complete within {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Create a timeout error from a duration
    pub fn timeout(duration: Duration) -> Self {
        ProcessError::Timeout {
            timeout_ms: duration.as_millis() as u64,
        }
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }

    /// Check if this is an invalid state error
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, ProcessError::InvalidState(_))
    }
}

/// Boot error type
///
/// Represents failures of the child side of the bootstrap protocol.
#[derive(Error, Debug)]
pub enum BootError {
    /// The environment does not name an entry point
    #[error("No entry point specified")]
    MissingEntryPoint,

    /// The named entry point is not registered
    #[error("Unknown entry point: {name}")]
    UnknownEntryPoint {
        /// The requested entry point.
        name: String,
    },

    /// A bootstrap environment variable is malformed
    #[error("Invalid bootstrap environment {key}={value}")]
    InvalidEnvironment {
        /// The environment variable name.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// The child bus endpoint could not be opened
    #[error(transparent)]
    Bus(#[from] EventBusError),

    /// The entry point itself failed
    #[error("Entry point failed: {0}")]
    Entry(ListenerError),

    /// Termination signal handling could not be installed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for ipcbus
///
/// A unified error type that can represent any error from all layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Event bus error
    #[error(transparent)]
    EventBus(#[from] EventBusError),

    /// Process error
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Boot error
    #[error(transparent)]
    Boot(#[from] BootError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Process(e) if e.is_timeout())
    }

    /// Check if this is an event bus error
    pub fn is_event_bus_error(&self) -> bool {
        matches!(self, Error::EventBus(_))
    }

    /// Check if this is a process error
    pub fn is_process_error(&self) -> bool {
        matches!(self, Error::Process(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
