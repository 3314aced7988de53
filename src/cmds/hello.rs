use std::io;

use anyhow::Result;

use super::{load_and_attach, open_substrate, open_trace_pipe, shutdown_on_ctrlc};
use crate::config::Config;
use crate::handlers::{HELLO, HELLO_COUNTER};
use crate::poll::PollLoop;

/// Print "Hello World!" every time a program is executed. With `counter` the
/// lines are numbered from a BPF global and the total is printed on exit.
pub fn run(config: &Config, counter: bool) -> Result<()> {
    let mut substrate = open_substrate(config)?;
    let attach = config.attach_points(&["syscall:execve"])?;
    let name = if counter { HELLO_COUNTER } else { HELLO };
    load_and_attach(&mut substrate, name, &attach)?;

    let mut trace = open_trace_pipe()?;
    let shutdown = shutdown_on_ctrlc();
    PollLoop::new(shutdown, config.interval)
        .trace(&mut trace)
        .run(&mut io::stdout().lock())?;

    if counter {
        println!("{} ran {} times", HELLO_COUNTER, substrate.hello_count()?);
    }
    Ok(())
}
