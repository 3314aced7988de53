// End to end dispatch on the in-process substrate: plan -> table -> entry
// probe -> handlers -> channel/counters/trace -> poll loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use syscalls::Sysno;

use tailtrace::attach::ProgramKind;
use tailtrace::channel::{TelemetryChannel, TelemetryConsumer};
use tailtrace::counter::CounterStore;
use tailtrace::dispatch::{DispatchTable, HandlerInvoker, MAX_TAIL_CALLS};
use tailtrace::handlers::{
    register_all, register_entry, HandlerSinks, HELLO_DISPATCH, HELLO_FUNC,
};
use tailtrace::native::{NativeProgram, NativeSubstrate};
use tailtrace::poll::PollLoop;
use tailtrace::probe::EventContext;
use tailtrace::record::Record;
use tailtrace::trace::TraceBuffer;
use tailtrace::{AttachPoint, DispatchPlan, Substrate, TransferOutcome};

struct Harness {
    substrate: NativeSubstrate,
    trace: Arc<TraceBuffer>,
    consumer: TelemetryConsumer,
    counters: Arc<CounterStore>,
}

fn harness(capacity: usize) -> Harness {
    let trace = Arc::new(TraceBuffer::default());
    let (output, consumer) = TelemetryChannel::bounded(capacity);
    let counters = Arc::new(CounterStore::new());
    let sinks = HandlerSinks {
        trace: trace.clone(),
        output,
        counters: counters.clone(),
        hello_count: Default::default(),
    };
    let mut substrate = NativeSubstrate::new();
    register_all(&mut substrate, &sinks);
    Harness {
        substrate,
        trace,
        consumer,
        counters,
    }
}

fn sys_enter() -> AttachPoint {
    AttachPoint::raw_tracepoint("sys_enter")
}

#[test]
fn test_exec_and_timer_routing() {
    let mut h = harness(16);
    let point = sys_enter();

    let exec = h.substrate.load("hello_execve", &point).unwrap();
    let timer = h.substrate.load("hello_timer", &point).unwrap();
    let execve = Sysno::execve.id() as i64;
    let timer_create = Sysno::timer_create.id() as i64;
    let mut table = DispatchTable::new(300);
    table.set(execve, exec).unwrap();
    table.set(timer_create, timer).unwrap();
    let table = Arc::new(table);

    register_entry(&mut h.substrate, HELLO_DISPATCH, table.clone(), h.trace.clone());
    let entry = h.substrate.load(HELLO_DISPATCH, &point).unwrap();
    h.substrate.attach(entry, &point).unwrap();

    assert!(h.substrate.deliver(&point, &EventContext::new(execve)));
    assert_eq!(
        h.trace.take().iter().map(|l| l.message.as_str()).collect::<Vec<_>>(),
        vec!["Executing a program"]
    );

    // Unset slot: nothing ran, the entry probe logs instead.
    let invoker = h.substrate.handlers();
    assert_eq!(
        table.transfer(&invoker, &EventContext::new(1), 1),
        TransferOutcome::Refused
    );
    h.substrate.deliver(&point, &EventContext::new(1));
    assert_eq!(h.trace.take()[0].message, "Another syscall: 1");

    h.substrate.deliver(&point, &EventContext::new(timer_create));
    assert_eq!(h.trace.take()[0].message, "Creating a timer");
}

#[test]
fn test_called_helper_versus_tail_call() {
    let point = sys_enter();
    let read = Sysno::read.id() as i64;

    // Attached directly, hello_func calls get_opcode and returns.
    let mut direct = harness(16);
    let id = direct.substrate.load(HELLO_FUNC, &point).unwrap();
    direct.substrate.attach(id, &point).unwrap();
    let ctx = EventContext::new(read);
    assert!(direct.substrate.deliver(&point, &ctx));
    assert_eq!(ctx.tail_calls(), 0);
    assert_eq!(direct.trace.take()[0].message, format!("Syscall: {}", read));

    // Routed through the table, the same handler costs one transfer.
    let mut routed = harness(16);
    let id = routed.substrate.load(HELLO_FUNC, &point).unwrap();
    let mut table = DispatchTable::new(300);
    table.set(read, id).unwrap();
    register_entry(
        &mut routed.substrate,
        HELLO_DISPATCH,
        Arc::new(table),
        routed.trace.clone(),
    );
    let entry = routed.substrate.load(HELLO_DISPATCH, &point).unwrap();
    routed.substrate.attach(entry, &point).unwrap();
    let ctx = EventContext::new(read);
    assert!(routed.substrate.deliver(&point, &ctx));
    assert_eq!(ctx.tail_calls(), 1);
    assert_eq!(routed.trace.take()[0].message, format!("Syscall: {}", read));
}

#[test]
fn test_shared_handler_identity() {
    let mut h = harness(16);
    let point = sys_enter();
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    h.substrate.register(
        "shared",
        NativeProgram::new(ProgramKind::RawTracepoint, move |_, _| {
            counted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );

    let mut table = DispatchTable::new(10);
    for code in [2, 5, 7] {
        let id = h.substrate.load("shared", &point).unwrap();
        table.set(code, id).unwrap();
    }
    assert_eq!(table.resolve(2), table.resolve(5));
    assert_eq!(table.resolve(5), table.resolve(7));
    assert_eq!(h.substrate.handlers().len(), 1);

    let invoker = h.substrate.handlers();
    for code in [2, 5, 7] {
        let outcome = table.transfer(&invoker, &EventContext::new(code), code);
        assert_eq!(outcome, TransferOutcome::Transferred);
    }
    assert_eq!(hits.load(Ordering::Relaxed), 3);
}

#[test]
fn test_chain_limit() {
    let mut h = harness(16);
    let point = sys_enter();
    let depth = Arc::new(AtomicUsize::new(0));

    // A handler that transfers back into its own slot forever.
    let table = Arc::new(std::sync::OnceLock::<DispatchTable>::new());
    let looped = table.clone();
    let seen = depth.clone();
    h.substrate.register(
        "loop",
        NativeProgram::new(ProgramKind::RawTracepoint, move |ctx, invoker| {
            seen.fetch_max(ctx.tail_calls() as usize, Ordering::Relaxed);
            if let Some(table) = looped.get() {
                let _ = table.transfer(invoker, ctx, 0);
            }
            Ok(())
        }),
    );
    let id = h.substrate.load("loop", &point).unwrap();
    let mut t = DispatchTable::new(1);
    t.set(0, id).unwrap();
    assert!(table.set(t).is_ok());

    let ctx = EventContext::new(0);
    let invoker = h.substrate.handlers();
    let outcome = table.get().unwrap().transfer(&invoker, &ctx, 0);
    assert_eq!(outcome, TransferOutcome::Transferred);
    assert_eq!(ctx.tail_calls(), MAX_TAIL_CALLS);
    assert_eq!(depth.load(Ordering::Relaxed), MAX_TAIL_CALLS as usize);
}

#[test]
fn test_concurrent_uid_counts() {
    let h = harness(16);
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let counters = h.counters.clone();
            thread::spawn(move || {
                counters.increment(1000);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(h.counters.snapshot(), vec![(1000, 3)]);
}

#[test]
fn test_overflow_drops_whole_records() {
    let (producer, mut consumer) = TelemetryChannel::bounded(4);
    let mut dropped = 0;
    for pid in 0..10 {
        if producer.submit(Record::new(pid, 0, b"cmd", b"msg")).is_err() {
            dropped += 1;
        }
    }
    assert_eq!(dropped, 6);
    assert_eq!(consumer.dropped(), 6);

    let mut records = Vec::new();
    consumer.drain(|r| records.push(r));
    assert_eq!(records.len(), 4);
    for (pid, record) in records.iter().enumerate() {
        assert_eq!(*record, Record::new(pid as i32, 0, b"cmd", b"msg"));
    }
}

#[test]
fn test_poll_loop_end_to_end() {
    let mut h = harness(64);
    let plan = DispatchPlan::default();
    let table = Arc::new(plan.build_table(&mut h.substrate).unwrap());
    register_entry(&mut h.substrate, &plan.entry, table, h.trace.clone());
    let entry = h.substrate.load(&plan.entry, &plan.attach).unwrap();
    h.substrate.attach(entry, &plan.attach).unwrap();

    let execve = AttachPoint::syscall("execve").unwrap();
    let logger = h.substrate.load("log_process_data", &execve).unwrap();
    h.substrate.attach(logger, &execve).unwrap();

    let substrate = Arc::new(h.substrate);
    let shutdown = Arc::new(AtomicBool::new(false));
    let producer = {
        let substrate = substrate.clone();
        let shutdown = shutdown.clone();
        let attach = plan.attach.clone();
        thread::spawn(move || {
            for _ in 0..5 {
                let ctx = EventContext::new(Sysno::execve.id() as i64)
                    .with_pid_tgid((4242u64 << 32) | 4242)
                    .with_uid_gid(1000)
                    .with_comm(b"sh");
                substrate.deliver(&attach, &ctx);
                substrate.deliver(&execve, &ctx);
                thread::sleep(Duration::from_millis(2));
            }
            shutdown.store(true, Ordering::SeqCst);
        })
    };

    let mut trace = h.trace.clone();
    let mut out = Vec::new();
    let stats = PollLoop::new(shutdown, Duration::from_secs(60))
        .poll_timeout(Duration::from_millis(5))
        .telemetry(&mut h.consumer)
        .trace(&mut trace)
        .run(&mut out)
        .unwrap();
    producer.join().unwrap();

    assert_eq!(stats.records, 5);
    assert_eq!(stats.trace_lines, 5);
    let out = String::from_utf8(out).unwrap();
    assert_eq!(out.matches("4242 1000 sh Hello World\n").count(), 5);
    assert_eq!(
        out.matches("sh-4242 [000] bpf_trace_printk: Executing a program\n")
            .count(),
        5
    );
}

#[test]
fn test_invoker_is_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<tailtrace::native::NativeHandlers>();
    let h = harness(1);
    let invoker: &dyn HandlerInvoker = &h.substrate.handlers();
    assert!(invoker
        .invoke(tailtrace::HandlerId::new(99), &EventContext::new(0))
        .is_err());
}
