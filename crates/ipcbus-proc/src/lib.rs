//! # ipcbus Proc
//!
//! Child process supervision for ipcbus.
//!
//! Supports:
//! - Spawning processes with piped, recorded or redirected stdio
//! - Waiting, timeouts, destruction and completion hooks
//! - The bootstrap protocol wiring a child process to an event bus

pub mod boot;
pub mod event_process;
pub mod multiplex;
pub mod pipe;
pub mod platform;
pub mod process;

pub use boot::{Boot, BootContext, EntryPoint};
pub use event_process::{
    EventProcess, EventProcessBuilder, ProcessBus, CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY,
    ENV_BIND, ENV_DEBUG, ENV_ENTRY, ENV_PORT,
};
pub use multiplex::{Multiplexer, Recorder, Sink};
pub use pipe::{Pipe, DEFAULT_BUFFER_SIZE};
pub use platform::{current_pid, exit_code, minimum_sleep, FORCED_KILL_EXIT_CODE, UNKNOWN_PID};
pub use process::{NoHooks, Process, ProcessBuilder, ProcessHooks};
