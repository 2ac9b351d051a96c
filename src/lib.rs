//! # ipcbus
//!
//! An inter-process event bus for Rust with support for:
//! - Named events with JSON payloads, dispatched synchronously to listeners
//! - Pluggable error policies for failing listeners
//! - Socket-backed client and server buses relaying events between processes
//! - Supervised child processes with piped, recorded or redirected stdio
//! - A bootstrap protocol wiring a spawned child to its parent's bus
//!
//! ## Architecture
//!
//! ipcbus is organized as a workspace with multiple crates:
//!
//! 1. **ipcbus-core** - Events, listeners, registry, local bus, config, errors
//! 2. **ipcbus-net** - Wire codec, remote client and server buses
//! 3. **ipcbus-proc** - Pipes, process supervisor, bootstrap protocol
//! 4. **ipcbus** - This crate, re-exporting the others plus the `ipcbus-child` boot host

pub use ipcbus_core::{bus, config, error, event, registry};
pub use ipcbus_net::wire;
pub use ipcbus_proc::{boot, multiplex, pipe, platform, process};

pub use ipcbus_core::{
    listener, same_listener, text, BootError, BusConfig, BusOptions, Error, ErrorPolicy, Event,
    EventBus, EventBusBuilder, EventBusError, EventData, EventListener, ListenerError,
    ListenerRef, ListenerRegistry, ListenerResult, LocalEventBus, PrintErrors, ProcessError,
    RecordErrors, RecordedError, Result, RethrowErrors, SystemEvent, DEFAULT_BIND_ADDRESS,
    DEFAULT_HOST, DEFAULT_PORT, RESERVED_PREFIX, WILDCARD,
};

pub use ipcbus_net::{EventBusClient, EventBusClientBuilder, EventBusServer, EventBusServerBuilder, RemoteEventBus};

pub use ipcbus_proc::{
    minimum_sleep, Boot, BootContext, EntryPoint, EventProcess, EventProcessBuilder, Multiplexer,
    Pipe, Process, ProcessBuilder, ProcessBus, ProcessHooks, Recorder, FORCED_KILL_EXIT_CODE,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Output on stderr, so a child's stdout only carries what it prints
/// - RUST_LOG environment variable support
/// - Thread names, which carry the bus or process id
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
