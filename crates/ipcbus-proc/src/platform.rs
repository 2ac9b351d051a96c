//! Platform shims
//!
//! PID lookup, exit status mapping and a sleep that never returns early.

use std::io;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

/// PID reported when the platform cannot tell
pub const UNKNOWN_PID: i64 = -1;

/// Exit code reported for a process ended by [`terminate`] (SIGTERM)
#[cfg(unix)]
pub const FORCED_KILL_EXIT_CODE: i32 = 128 + 15;

/// Exit code reported for a forcibly killed process
#[cfg(windows)]
pub const FORCED_KILL_EXIT_CODE: i32 = 1;

/// Exit code reported for a forcibly killed process
#[cfg(not(any(unix, windows)))]
pub const FORCED_KILL_EXIT_CODE: i32 = -1;

/// PID of a spawned child, or [`UNKNOWN_PID`]
pub fn pid_of(child: &Child) -> i64 {
    match child.id() {
        0 => UNKNOWN_PID,
        pid => i64::from(pid),
    }
}

/// Ask a child to terminate.
///
/// On Unix this sends SIGTERM, leaving the child a chance to run its own
/// shutdown handling; elsewhere the process is killed outright. The caller
/// must not have reaped the child yet.
#[cfg(unix)]
pub fn terminate(child: &mut Child) -> io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::other(format!("pid {} out of range", child.id())))?;
    // SAFETY: kill(2) takes no pointers; the pid belongs to an unreaped child.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Ask a child to terminate
#[cfg(not(unix))]
pub fn terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

/// PID of the current process
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Numeric exit code of a finished process.
///
/// On Unix a process terminated by a signal reports `128 + signal`, as a
/// shell would.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Sleep for at least `duration` measured on the monotonic clock
pub fn minimum_sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(deadline - now);
    }
}
