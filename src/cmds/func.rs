use std::io;

use anyhow::Result;

use super::{load_and_attach, open_substrate, open_trace_pipe, shutdown_on_ctrlc};
use crate::config::Config;
use crate::handlers::HELLO_FUNC;
use crate::poll::PollLoop;

/// Log every syscall number from `hello_func`, which reads it through a
/// called subprogram instead of the dispatch table.
pub fn run(config: &Config) -> Result<()> {
    let mut substrate = open_substrate(config)?;
    let attach = config.attach_points(&["raw_tp:sys_enter"])?;
    load_and_attach(&mut substrate, HELLO_FUNC, &attach)?;

    let mut trace = open_trace_pipe()?;
    let shutdown = shutdown_on_ctrlc();
    PollLoop::new(shutdown, config.interval)
        .trace(&mut trace)
        .run(&mut io::stdout().lock())?;
    Ok(())
}
