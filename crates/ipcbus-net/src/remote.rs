//! Socket-backed bus interface

use ipcbus_core::EventBus;

/// Event bus owning a socket resource
///
/// Closing is terminal: a closed bus cannot be reopened, build a new one.
pub trait RemoteEventBus: EventBus {
    /// Release the socket and stop the background thread.
    ///
    /// Safe to call several times and from several threads; exactly one call
    /// performs the teardown and emits the terminal event.
    fn close(&self);

    /// Whether the socket has been released
    fn is_closed(&self) -> bool;

    /// Port of the server side of the connection
    fn server_port(&self) -> u16;
}
