//! The `tailtrace` subcommands.
//!
//! `hello`, `buffer`, `count`, `func` and `dispatch` load the BPF object and need
//! root (or CAP_BPF + CAP_PERFMON). `simulate` runs the same handlers in
//! process and needs nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::attach::AttachPoint;
use crate::bpf::{bump_memlock_rlimit, BpfSubstrate};
use crate::config::Config;
use crate::substrate::Substrate;
use crate::trace_pipe::TracePipe;

pub mod buffer;
pub mod count;
pub mod dispatch;
pub mod func;
pub mod hello;
pub mod simulate;

fn open_substrate(config: &Config) -> Result<BpfSubstrate> {
    bump_memlock_rlimit()?;
    BpfSubstrate::open(config.object.as_deref(), config.verbose)
}

/// Load `name` once and attach it to every point in `attach`.
fn load_and_attach<S: Substrate>(
    substrate: &mut S,
    name: &str,
    attach: &[AttachPoint],
) -> Result<()> {
    let Some(first) = attach.first() else {
        anyhow::bail!("No event sources to attach '{}' to", name);
    };
    let handler = substrate
        .load(name, first)
        .with_context(|| format!("Failed to load '{}' for {}", name, first))?;
    for point in attach {
        substrate
            .attach(handler, point)
            .with_context(|| format!("Failed to attach '{}' to {}", name, point))?;
    }
    Ok(())
}

fn open_trace_pipe() -> Result<TracePipe> {
    let pipe = TracePipe::open()?;
    info!("Reading bpf_printk output from {}", pipe.path().display());
    Ok(pipe)
}

/// Flag set by Ctrl-C.
fn shutdown_on_ctrlc() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    // Ignore MultipleHandlers error (e.g., in test harnesses).
    let _ = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    });
    println!("Press Ctrl-C to stop");
    shutdown
}
