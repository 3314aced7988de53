use std::io;

use anyhow::Result;
use log::info;

use super::{load_and_attach, open_substrate, open_trace_pipe, shutdown_on_ctrlc};
use crate::config::{Config, DISPATCH_MAP};
use crate::poll::PollLoop;

/// Route every syscall through the `syscall` program array.
pub fn run(config: &Config) -> Result<()> {
    let plan = &config.plan;
    let mut substrate = open_substrate(config)?;

    let table = plan.build_table(&mut substrate)?;
    substrate.install_dispatch(DISPATCH_MAP, &table)?;
    info!(
        "{} of {} dispatch slots populated",
        table.populated(),
        table.capacity()
    );
    // The entry goes live last so it never sees a half filled table.
    load_and_attach(&mut substrate, &plan.entry, std::slice::from_ref(&plan.attach))?;

    let mut trace = open_trace_pipe()?;
    let shutdown = shutdown_on_ctrlc();
    PollLoop::new(shutdown, config.interval)
        .trace(&mut trace)
        .run(&mut io::stdout().lock())?;
    Ok(())
}
