use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;

use super::load_and_attach;
use crate::attach::AttachPoint;
use crate::channel::TelemetryChannel;
use crate::config::Config;
use crate::counter::CounterStore;
use crate::handlers::{register_all, register_entry, HandlerSinks, COUNT_BY_UID, LOG_PROCESS_DATA};
use crate::native::NativeSubstrate;
use crate::poll::{PollLoop, PollStats};
use crate::probe::EventContext;
use crate::substrate::Substrate;
use crate::trace::TraceBuffer;

/// Kprobes hooked up next to the dispatch entry. execve's kprobe belongs to
/// `log_process_data`, a source only takes one handler.
const RECORD_ON: &[&str] = &["syscall:execve"];
const COUNT_ON: &[&str] = &["syscall:openat", "syscall:write"];

/// Feed `codes` through the dispatch plan in process, as if the calling thread
/// had made those syscalls, then print everything the handlers produced.
pub fn run(config: &Config, codes: &[i64], out: &mut dyn Write) -> Result<PollStats> {
    let plan = &config.plan;
    let trace = Arc::new(TraceBuffer::default());
    let (output, mut consumer) = TelemetryChannel::bounded(config.channel_capacity);
    let counters = Arc::new(CounterStore::new());
    let sinks = HandlerSinks {
        trace: trace.clone(),
        output,
        counters: counters.clone(),
        hello_count: Default::default(),
    };

    let mut substrate = NativeSubstrate::new();
    register_all(&mut substrate, &sinks);

    let table = Arc::new(plan.build_table(&mut substrate)?);
    debug!(
        "{} of {} dispatch slots populated",
        table.populated(),
        table.capacity()
    );
    register_entry(&mut substrate, &plan.entry, table, trace.clone());
    load_and_attach(&mut substrate, &plan.entry, std::slice::from_ref(&plan.attach))?;

    let record_on = parse_points(RECORD_ON)?;
    let count_on = parse_points(COUNT_ON)?;
    load_and_attach(&mut substrate, LOG_PROCESS_DATA, &record_on)?;
    load_and_attach(&mut substrate, COUNT_BY_UID, &count_on)?;

    // Syscall entry kprobes fire alongside the dispatch entry.
    let syscall_probes: Vec<(i64, AttachPoint)> = substrate
        .attach_points()
        .filter_map(|attach| Some((attach.syscall_number()?, attach.clone())))
        .collect();
    for code in codes {
        substrate.deliver(&plan.attach, &EventContext::current(*code));
        for (_, kprobe) in syscall_probes.iter().filter(|(nr, _)| nr == code) {
            substrate.deliver(kprobe, &EventContext::current(*code));
        }
    }

    // Every event is in, so the loop only needs its final drain.
    let shutdown = Arc::new(AtomicBool::new(true));
    let mut trace_source = trace.clone();
    let stats = PollLoop::new(shutdown, config.interval)
        .telemetry(&mut consumer)
        .counters(counters.as_ref())
        .trace(&mut trace_source)
        .run(out)?;

    writeln!(
        out,
        "{} events, {} records dropped, {} trace lines overwritten",
        codes.len(),
        consumer.dropped(),
        trace.overwritten()
    )?;
    Ok(stats)
}

fn parse_points(points: &[&str]) -> Result<Vec<AttachPoint>> {
    points
        .iter()
        .map(|s| s.parse().with_context(|| format!("Bad attach point {}", s)))
        .collect()
}
