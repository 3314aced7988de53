use std::io;

use anyhow::Result;

use super::{load_and_attach, open_substrate, shutdown_on_ctrlc};
use crate::bpf::{DROPPED_MAP, OUTPUT_MAP};
use crate::channel::TelemetrySource;
use crate::config::Config;
use crate::handlers::LOG_PROCESS_DATA;
use crate::poll::PollLoop;

/// Stream a record per execve through the ring buffer.
pub fn run(config: &Config) -> Result<()> {
    let mut substrate = open_substrate(config)?;
    let attach = config.attach_points(&["syscall:execve"])?;
    load_and_attach(&mut substrate, LOG_PROCESS_DATA, &attach)?;

    let mut telemetry = substrate.telemetry(OUTPUT_MAP, DROPPED_MAP)?;
    let shutdown = shutdown_on_ctrlc();
    let stats = PollLoop::new(shutdown, config.interval)
        .telemetry(&mut telemetry)
        .run(&mut io::stdout().lock())?;

    println!(
        "{} records received, {} dropped",
        stats.records,
        telemetry.dropped()
    );
    Ok(())
}
