//! # ipcbus Net
//!
//! Socket-backed event buses for ipcbus.
//!
//! Supports:
//! - A client bus bound to one TCP connection
//! - A server bus fanning events out to and in from many clients
//! - A JSON envelope stream as the wire format

pub mod client;
pub mod remote;
pub mod server;
pub mod wire;

pub use client::{EventBusClient, EventBusClientBuilder};
pub use remote::RemoteEventBus;
pub use server::{EventBusServer, EventBusServerBuilder};
