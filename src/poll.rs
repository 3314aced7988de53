//! The user side consumer.
//!
//! One thread drains up to three sources until asked to stop: telemetry
//! records as they arrive, trace lines, and a counter snapshot every
//! `interval`. Once the shutdown flag is seen every source gets one last drain
//! so nothing submitted before the stop is lost.

use std::fmt::Write as _;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::channel::TelemetrySource;
use crate::counter::CounterSource;
use crate::record::Record;
use crate::trace::{TraceLine, TraceSource};

/// How long one telemetry poll waits for the first record.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// `pid uid command message`
pub fn format_record(record: &Record) -> String {
    record.to_string()
}

/// `ID <key>: <value>\t` for every non-zero entry.
pub fn format_counters(snapshot: &[(u64, u64)]) -> String {
    let mut line = String::new();
    for (key, value) in snapshot.iter().filter(|(_, v)| *v != 0) {
        let _ = write!(line, "ID {}: {}\t", key, value);
    }
    line
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub records: usize,
    pub trace_lines: usize,
    pub snapshots: usize,
}

pub struct PollLoop<'a> {
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    poll_timeout: Duration,
    telemetry: Option<&'a mut dyn TelemetrySource>,
    counters: Option<&'a dyn CounterSource>,
    trace: Option<&'a mut dyn TraceSource>,
}

impl<'a> PollLoop<'a> {
    pub fn new(shutdown: Arc<AtomicBool>, interval: Duration) -> Self {
        PollLoop {
            shutdown,
            interval,
            poll_timeout: POLL_TIMEOUT,
            telemetry: None,
            counters: None,
            trace: None,
        }
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn telemetry(mut self, source: &'a mut dyn TelemetrySource) -> Self {
        self.telemetry = Some(source);
        self
    }

    pub fn counters(mut self, source: &'a dyn CounterSource) -> Self {
        self.counters = Some(source);
        self
    }

    pub fn trace(mut self, source: &'a mut dyn TraceSource) -> Self {
        self.trace = Some(source);
        self
    }

    /// Run until the shutdown flag is set, writing everything drained to `out`.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<PollStats> {
        let mut stats = PollStats::default();
        let mut last_snapshot = Instant::now();

        loop {
            // Read the flag before draining so the drain that follows it is
            // the final one.
            let stopping = self.shutdown.load(Ordering::SeqCst);
            let timeout = if stopping {
                Duration::ZERO
            } else {
                self.poll_timeout
            };

            match self.telemetry.as_deref_mut() {
                Some(telemetry) => {
                    let mut records = Vec::new();
                    telemetry
                        .poll(timeout, &mut |record: Record| records.push(record))
                        .context("Failed to poll telemetry")?;
                    for record in records.iter() {
                        writeln!(out, "{}", format_record(record))?;
                    }
                    stats.records += records.len();
                }
                None if !stopping => thread::sleep(timeout),
                None => {}
            }

            if let Some(trace) = self.trace.as_deref_mut() {
                let mut lines: Vec<TraceLine> = Vec::new();
                trace
                    .drain(&mut |line: TraceLine| lines.push(line))
                    .context("Failed to read trace lines")?;
                for line in lines.iter() {
                    writeln!(out, "{}", line)?;
                }
                stats.trace_lines += lines.len();
            }

            if let Some(counters) = self.counters {
                if stopping || last_snapshot.elapsed() >= self.interval {
                    let snapshot = counters.snapshot().context("Failed to read counters")?;
                    writeln!(out, "{}", format_counters(&snapshot))?;
                    stats.snapshots += 1;
                    last_snapshot = Instant::now();
                }
            }
            out.flush()?;

            if stopping {
                break;
            }
        }
        Ok(stats)
    }
}
