//! Listener and error policy interfaces
//!
//! Listeners receive events synchronously on the dispatching thread. A
//! failing listener never aborts delivery by itself: its error is handed to
//! the bus's [`ErrorPolicy`], which decides whether dispatch goes on.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{EventBusError, ListenerError};
use crate::event::Event;

/// Result returned by listeners
pub type ListenerResult = Result<(), ListenerError>;

/// Listener trait for bus events
///
/// Implemented for every `Fn(&Event) -> ListenerResult` closure.
pub trait EventListener: Send + Sync {
    /// Called for every event delivered to this listener
    fn on_event(&self, event: &Event) -> ListenerResult;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, event: &Event) -> ListenerResult {
        self(event)
    }
}

/// Shared handle to a registered listener.
///
/// Identity is the allocation: the same handle registered twice is the same
/// listener for `unbind`.
pub type ListenerRef = Arc<dyn EventListener>;

/// Wrap a closure into a listener handle
pub fn listener<F>(f: F) -> ListenerRef
where
    F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Check whether two handles point to the same listener
pub fn same_listener(a: &ListenerRef, b: &ListenerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Invoke a listener, turning a panic into a listener error
pub(crate) fn invoke(listener: &ListenerRef, event: &Event) -> ListenerResult {
    match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("listener panicked: {}", message).into())
        }
    }
}

/// Policy deciding what happens when a listener fails.
///
/// Returning `Err` aborts the current dispatch and propagates the error to
/// the caller of `trigger`; returning `Ok` lets dispatch continue with the
/// remaining listeners.
pub trait ErrorPolicy: Send + Sync {
    /// Handle a listener failure for `event`
    fn on_error(&self, event: &Event, error: ListenerError) -> Result<(), EventBusError>;
}

/// Propagate listener failures to the caller of `trigger`
#[derive(Debug, Default, Clone, Copy)]
pub struct RethrowErrors;

impl ErrorPolicy for RethrowErrors {
    fn on_error(&self, event: &Event, error: ListenerError) -> Result<(), EventBusError> {
        Err(EventBusError::Listener {
            event: event.name().to_string(),
            source: error,
        })
    }
}

/// Log listener failures and continue dispatch
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintErrors;

impl ErrorPolicy for PrintErrors {
    fn on_error(&self, event: &Event, error: ListenerError) -> Result<(), EventBusError> {
        tracing::error!("Listener failed on {}: {}", event, error);
        Ok(())
    }
}

/// A listener failure captured by [`RecordErrors`]
#[derive(Debug, Clone)]
pub struct RecordedError {
    /// The event being dispatched.
    pub event: Event,
    /// Rendered error message.
    pub message: String,
}

/// Record listener failures and continue dispatch
#[derive(Debug, Default)]
pub struct RecordErrors {
    errors: Mutex<Vec<RecordedError>>,
}

impl RecordErrors {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Whether no failure was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Snapshot of the recorded failures
    pub fn errors(&self) -> Vec<RecordedError> {
        self.errors.lock().clone()
    }

    /// Drop every recorded failure
    pub fn clear(&self) {
        self.errors.lock().clear();
    }
}

impl ErrorPolicy for RecordErrors {
    fn on_error(&self, event: &Event, error: ListenerError) -> Result<(), EventBusError> {
        self.errors.lock().push(RecordedError {
            event: event.clone(),
            message: error.to_string(),
        });
        Ok(())
    }
}
