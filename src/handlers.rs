//! Native versions of the handlers in `src/bpf/tailtrace.bpf.c`.
//!
//! Names match the BPF program names so one dispatch plan drives either
//! substrate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use syscalls::Sysno;

use crate::attach::ProgramKind;
use crate::channel::TelemetryProducer;
use crate::counter::CounterStore;
use crate::dispatch::DispatchTable;
use crate::native::{NativeProgram, NativeSubstrate};
use crate::probe::{EntryProbe, EventContext};
use crate::record::Record;
use crate::trace::TraceSink;

pub const HELLO: &str = "hello";
pub const HELLO_COUNTER: &str = "hello_counter";
pub const LOG_PROCESS_DATA: &str = "log_process_data";
pub const COUNT_BY_UID: &str = "count_by_uid";
pub const HELLO_DISPATCH: &str = "hello_dispatch";
pub const HELLO_EXECVE: &str = "hello_execve";
pub const HELLO_TIMER: &str = "hello_timer";
pub const IGNORE_OPCODE: &str = "ignore_opcode";
pub const HELLO_FUNC: &str = "hello_func";

const RECORD_MESSAGE: &[u8] = b"Hello World";

pub fn hello(trace: Arc<dyn TraceSink>) -> NativeProgram {
    NativeProgram::new(ProgramKind::Kprobe, move |ctx, _| {
        trace.emit(ctx, "Hello World!");
        Ok(())
    })
}

/// Like [`hello`], numbering each line with a count shared by every caller.
pub fn hello_counter(trace: Arc<dyn TraceSink>, count: Arc<AtomicU64>) -> NativeProgram {
    NativeProgram::new(ProgramKind::Kprobe, move |ctx, _| {
        let seen = count.fetch_add(1, Ordering::Relaxed);
        trace.emit(ctx, &format!("Hello World {seen}"));
        Ok(())
    })
}

pub fn log_process_data(output: TelemetryProducer) -> NativeProgram {
    NativeProgram::new(ProgramKind::Kprobe, move |ctx, _| {
        // Drops are counted by the channel, the handler carries on either way.
        let _ = output.submit(Record::from_context(ctx, RECORD_MESSAGE));
        Ok(())
    })
}

pub fn count_by_uid(counters: Arc<CounterStore>) -> NativeProgram {
    NativeProgram::new(ProgramKind::Kprobe, move |ctx, _| {
        counters.increment(ctx.uid as u64);
        Ok(())
    })
}

pub fn hello_execve(trace: Arc<dyn TraceSink>) -> NativeProgram {
    NativeProgram::new(ProgramKind::RawTracepoint, move |ctx, _| {
        trace.emit(ctx, "Executing a program");
        Ok(())
    })
}

pub fn hello_timer(trace: Arc<dyn TraceSink>) -> NativeProgram {
    let create = Sysno::timer_create.id() as i64;
    let delete = Sysno::timer_delete.id() as i64;
    NativeProgram::new(ProgramKind::RawTracepoint, move |ctx, _| {
        let message = if ctx.code == create {
            "Creating a timer"
        } else if ctx.code == delete {
            "Deleting a timer"
        } else {
            "Some other timer operation"
        };
        trace.emit(ctx, message);
        Ok(())
    })
}

pub fn ignore_opcode() -> NativeProgram {
    NativeProgram::new(ProgramKind::RawTracepoint, |_, _| Ok(()))
}

#[inline(never)]
fn get_opcode(ctx: &EventContext) -> i64 {
    ctx.code
}

/// Logs every syscall from a single program. The opcode comes from a helper
/// that is called and returns, so no dispatch slot or tail call is used.
pub fn hello_func(trace: Arc<dyn TraceSink>) -> NativeProgram {
    NativeProgram::new(ProgramKind::RawTracepoint, move |ctx, _| {
        let opcode = get_opcode(ctx);
        trace.emit(ctx, &format!("Syscall: {opcode}"));
        Ok(())
    })
}

pub fn hello_dispatch(probe: EntryProbe) -> NativeProgram {
    NativeProgram::new(ProgramKind::RawTracepoint, move |ctx, invoker| {
        // A refused transfer has already been logged by the probe.
        let _ = probe.handle(invoker, ctx);
        Ok(())
    })
}

/// Where the native handlers send their output.
#[derive(Clone)]
pub struct HandlerSinks {
    pub trace: Arc<dyn TraceSink>,
    pub output: TelemetryProducer,
    pub counters: Arc<CounterStore>,
    /// Backs `hello_counter`, the `hello_count` global in BPF.
    pub hello_count: Arc<AtomicU64>,
}

/// Register every leaf handler with `substrate`. The entry probe needs the
/// finished dispatch table, see [`register_entry`].
pub fn register_all(substrate: &mut NativeSubstrate, sinks: &HandlerSinks) {
    substrate.register(HELLO, hello(sinks.trace.clone()));
    substrate.register(
        HELLO_COUNTER,
        hello_counter(sinks.trace.clone(), sinks.hello_count.clone()),
    );
    substrate.register(LOG_PROCESS_DATA, log_process_data(sinks.output.clone()));
    substrate.register(COUNT_BY_UID, count_by_uid(sinks.counters.clone()));
    substrate.register(HELLO_EXECVE, hello_execve(sinks.trace.clone()));
    substrate.register(HELLO_TIMER, hello_timer(sinks.trace.clone()));
    substrate.register(IGNORE_OPCODE, ignore_opcode());
    substrate.register(HELLO_FUNC, hello_func(sinks.trace.clone()));
}

/// Register the entry probe `name` routing through `table`.
pub fn register_entry(
    substrate: &mut NativeSubstrate,
    name: &str,
    table: Arc<DispatchTable>,
    trace: Arc<dyn TraceSink>,
) {
    substrate.register(name, hello_dispatch(EntryProbe::new(table, trace)));
}
