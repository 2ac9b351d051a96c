//! `ipcbus-child`: boot host for processes started through `EventProcess`.
//!
//! The entry point is picked by `IPCBUS_ENTRY`:
//! - `echo` answers every `ping` with a `pong` carrying the same data, until
//!   `stop` or the parent asks it to exit
//! - `worker` returns at once and leaves a worker thread waiting for `go`,
//!   which it answers with `worker.done`
//! - `fail` returns an error

use ipcbus::{init_logging, listener, Boot, BootContext, EventBus};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long an entry point waits for its parent
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

fn echo(ctx: &BootContext) -> anyhow::Result<()> {
    let bus = Arc::downgrade(&ctx.bus_handle());
    ctx.bus().on(
        "ping",
        listener(move |event| {
            if let Some(bus) = bus.upgrade() {
                bus.trigger("pong", event.data().cloned())?;
            }
            Ok(())
        }),
    )?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctx.bus().on(
        "stop",
        listener(move |_| {
            let _ = stop_tx.try_send(());
            Ok(())
        }),
    )?;

    if stop_rx.recv_timeout(IDLE_TIMEOUT).is_err() {
        tracing::warn!("No stop received within {:?}", IDLE_TIMEOUT);
    }
    Ok(())
}

fn worker(ctx: &BootContext) -> anyhow::Result<()> {
    let (go_tx, go_rx) = crossbeam_channel::bounded(1);
    ctx.bus().on(
        "go",
        listener(move |event| {
            let _ = go_tx.try_send(event.data().cloned());
            Ok(())
        }),
    )?;

    let bus = ctx.bus_handle();
    ctx.spawn("worker", move || match go_rx.recv_timeout(IDLE_TIMEOUT) {
        Ok(data) => {
            if let Err(e) = bus.trigger("worker.done", data) {
                tracing::error!("Cannot report completion: {}", e);
            }
        }
        Err(_) => tracing::warn!("No go received within {:?}", IDLE_TIMEOUT),
    })?;
    Ok(())
}

fn fail(_ctx: &BootContext) -> anyhow::Result<()> {
    anyhow::bail!("entry point failed on request")
}

fn main() -> anyhow::Result<()> {
    init_logging()?;

    Boot::new()
        .entry("echo", echo)
        .entry("worker", worker)
        .entry("fail", fail)
        .args(std::env::args().skip(1))
        .run()?;

    Ok(())
}
