//! Debug trace output: the `bpf_printk` side channel.
//!
//! Handlers write best-effort diagnostic lines through a [`TraceSink`]. In the
//! kernel these land in `trace_pipe`; in process they land in a bounded
//! [`TraceBuffer`]. Either way the poll loop reads them back as [`TraceLine`]s
//! through [`TraceSource`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::Result;
use regex::Regex;

use crate::probe::EventContext;

/// Lines kept by a [`TraceBuffer`] before the oldest are overwritten.
pub const DEFAULT_TRACE_LINES: usize = 4096;

/// Pattern for the `bpf_trace_printk` lines in `trace_pipe`, e.g.
/// `bash-1234    [003] d..31 12345.678901: bpf_trace_printk: Hello World!`
/// Newer kernels may add a `(tgid)` column after the task.
static TRACE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(.+?)-(\d+)\s+(?:\(\s*[-\d]+\)\s+)?\[(\d+)\]\s+\S+\s+[\d.]+:\s+bpf_trace_printk:\s?(.*)$",
    )
    .expect("Invalid trace line regex pattern")
});

pub trait TraceSink: Send + Sync {
    fn emit(&self, ctx: &EventContext, message: &str);
}

/// Anything the poll loop can drain trace lines from.
pub trait TraceSource {
    fn drain(&mut self, callback: &mut dyn FnMut(TraceLine)) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub comm: String,
    pub pid: i32,
    pub cpu: u32,
    pub message: String,
}

impl TraceLine {
    pub fn from_context(ctx: &EventContext, message: &str) -> Self {
        TraceLine {
            comm: ctx.comm(),
            pid: ctx.tid,
            cpu: ctx.cpu,
            message: message.to_string(),
        }
    }

    /// Parse one `trace_pipe` line. Lines not written by `bpf_trace_printk`
    /// give `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = TRACE_LINE_RE.captures(line.trim_end_matches('\n'))?;
        Some(TraceLine {
            comm: caps[1].trim().to_string(),
            pid: caps[2].parse().ok()?,
            cpu: caps[3].parse().ok()?,
            message: caps[4].to_string(),
        })
    }
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} [{:03}] bpf_trace_printk: {}",
            self.comm, self.pid, self.cpu, self.message
        )
    }
}

/// Bounded in-memory trace ring. Like the kernel's trace buffer it overwrites
/// the oldest line when full instead of blocking the writer.
#[derive(Debug)]
pub struct TraceBuffer {
    lines: Mutex<VecDeque<TraceLine>>,
    capacity: usize,
    overwritten: AtomicU64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        TraceBuffer {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_TRACE_LINES))),
            capacity: capacity.max(1),
            overwritten: AtomicU64::new(0),
        }
    }

    pub fn push(&self, line: TraceLine) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        lines.push_back(line);
    }

    pub fn take(&self) -> Vec<TraceLine> {
        self.lines.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_LINES)
    }
}

impl TraceSink for TraceBuffer {
    fn emit(&self, ctx: &EventContext, message: &str) {
        self.push(TraceLine::from_context(ctx, message));
    }
}

impl TraceSource for Arc<TraceBuffer> {
    fn drain(&mut self, callback: &mut dyn FnMut(TraceLine)) -> Result<usize> {
        let lines = self.take();
        let count = lines.len();
        lines.into_iter().for_each(callback);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trace_pipe_line() {
        let line = "            bash-1234    [003] d..31 12345.678901: bpf_trace_printk: Hello World!";
        let parsed = TraceLine::parse(line).unwrap();
        assert_eq!(
            parsed,
            TraceLine {
                comm: "bash".to_string(),
                pid: 1234,
                cpu: 3,
                message: "Hello World!".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_with_tgid_column_and_dashed_comm() {
        let line = " kworker/u8:2-88 (   88) [000] ...11   42.000001: bpf_trace_printk: Another syscall: 1\n";
        let parsed = TraceLine::parse(line).unwrap();
        assert_eq!(parsed.comm, "kworker/u8:2");
        assert_eq!(parsed.pid, 88);
        assert_eq!(parsed.cpu, 0);
        assert_eq!(parsed.message, "Another syscall: 1");

        let line = "   systemd-journal-412 [001] d..3. 9.5: bpf_trace_printk: Creating a timer";
        let parsed = TraceLine::parse(line).unwrap();
        assert_eq!(parsed.comm, "systemd-journal");
        assert_eq!(parsed.pid, 412);
    }

    #[test]
    fn test_parse_ignores_other_events() {
        assert!(TraceLine::parse("# tracer: nop").is_none());
        assert!(
            TraceLine::parse("   bash-1 [000] .... 1.0: sched_switch: prev_comm=bash").is_none()
        );
    }

    #[test]
    fn test_display_round_trips_through_parse_shape() {
        let line = TraceLine {
            comm: "cat".to_string(),
            pid: 7,
            cpu: 2,
            message: "Executing a program".to_string(),
        };
        assert_eq!(
            line.to_string(),
            "cat-7 [002] bpf_trace_printk: Executing a program"
        );
    }

    #[test]
    fn test_buffer_overwrites_oldest() {
        let buffer = TraceBuffer::new(2);
        let ctx = EventContext::new(0).with_comm(b"sh");
        buffer.emit(&ctx, "one");
        buffer.emit(&ctx, "two");
        buffer.emit(&ctx, "three");

        let lines: Vec<_> = buffer.take().into_iter().map(|l| l.message).collect();
        assert_eq!(lines, vec!["two", "three"]);
        assert_eq!(buffer.overwritten(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_as_source() {
        let mut buffer = Arc::new(TraceBuffer::default());
        buffer.emit(&EventContext::new(0), "Hello World!");
        let mut seen = Vec::new();
        assert_eq!(buffer.drain(&mut |l| seen.push(l.message)).unwrap(), 1);
        assert_eq!(seen, vec!["Hello World!"]);
        assert_eq!(buffer.drain(&mut |_| {}).unwrap(), 0);
    }
}
