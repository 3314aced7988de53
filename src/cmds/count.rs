use std::io;

use anyhow::Result;

use super::{load_and_attach, open_substrate, shutdown_on_ctrlc};
use crate::bpf::COUNTER_MAP;
use crate::config::Config;
use crate::handlers::COUNT_BY_UID;
use crate::poll::PollLoop;

/// One handler counting by uid across several syscalls.
pub fn run(config: &Config) -> Result<()> {
    let mut substrate = open_substrate(config)?;
    let attach =
        config.attach_points(&["syscall:execve", "syscall:openat", "syscall:write"])?;
    load_and_attach(&mut substrate, COUNT_BY_UID, &attach)?;

    let counters = substrate.counters(COUNTER_MAP)?;
    let shutdown = shutdown_on_ctrlc();
    PollLoop::new(shutdown, config.interval)
        .counters(&counters)
        .run(&mut io::stdout().lock())?;
    Ok(())
}
