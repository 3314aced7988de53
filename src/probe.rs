//! Per-event context and the entry probe that routes through the dispatch
//! table.

use std::cell::Cell;
use std::sync::Arc;

use log::debug;

use crate::attach::code_name;
use crate::dispatch::{DispatchTable, HandlerInvoker, TransferOutcome, MAX_TAIL_CALLS};
use crate::record::COMMAND_LEN;
use crate::trace::TraceSink;
use crate::utils::{
    copy_padded, cstr_lossy, gid_from_uidgid, pid_from_tgidpid, tid_from_tgidpid,
    uid_from_uidgid,
};

/// What a handler gets to see about the event that triggered it.
///
/// This is the in-process stand-in for a raw tracepoint's argument block plus
/// the `bpf_get_current_*` helpers. `code` is the syscall number (`args[1]` of
/// `sys_enter`).
#[derive(Debug, Clone)]
pub struct EventContext {
    pub code: i64,
    pub pid: i32,
    pub tid: i32,
    pub uid: u32,
    pub gid: u32,
    pub cpu: u32,
    pub comm: [u8; COMMAND_LEN],
    tail_calls: Cell<u32>,
}

impl EventContext {
    pub fn new(code: i64) -> Self {
        EventContext {
            code,
            pid: 0,
            tid: 0,
            uid: 0,
            gid: 0,
            cpu: 0,
            comm: [0; COMMAND_LEN],
            tail_calls: Cell::new(0),
        }
    }

    /// Context for the calling thread, the way the kernel helpers would fill
    /// it in for a probe firing on this task.
    pub fn current(code: i64) -> Self {
        let pid = unsafe { libc::getpid() };
        let tid = unsafe { libc::gettid() };
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let cpu = unsafe { libc::sched_getcpu() }.max(0) as u32;

        let mut comm = [0u8; COMMAND_LEN];
        let ret = unsafe { libc::prctl(libc::PR_GET_NAME, comm.as_mut_ptr(), 0, 0, 0) };
        if ret != 0 {
            comm = [0; COMMAND_LEN];
        }

        Self::new(code)
            .with_pid_tgid(((pid as u64) << 32) | tid as u32 as u64)
            .with_uid_gid(((gid as u64) << 32) | uid as u64)
            .with_comm(&comm)
            .with_cpu(cpu)
    }

    pub fn with_pid_tgid(mut self, pid_tgid: u64) -> Self {
        self.pid = pid_from_tgidpid(pid_tgid);
        self.tid = tid_from_tgidpid(pid_tgid);
        self
    }

    pub fn with_uid_gid(mut self, uid_gid: u64) -> Self {
        self.uid = uid_from_uidgid(uid_gid);
        self.gid = gid_from_uidgid(uid_gid);
        self
    }

    pub fn with_comm(mut self, comm: &[u8]) -> Self {
        self.comm = copy_padded(comm);
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn comm(&self) -> String {
        cstr_lossy(&self.comm)
    }

    /// Transfers taken so far while handling this event.
    pub fn tail_calls(&self) -> u32 {
        self.tail_calls.get()
    }

    /// Account for one more transfer. False once the chain limit is reached.
    pub(crate) fn enter_tail_call(&self) -> bool {
        let taken = self.tail_calls.get();
        if taken >= MAX_TAIL_CALLS {
            return false;
        }
        self.tail_calls.set(taken + 1);
        true
    }
}

/// The one handler attached to the event source. Everything else is reached
/// through the dispatch table.
pub struct EntryProbe {
    table: Arc<DispatchTable>,
    trace: Arc<dyn TraceSink>,
}

impl EntryProbe {
    pub fn new(table: Arc<DispatchTable>, trace: Arc<dyn TraceSink>) -> Self {
        EntryProbe { table, trace }
    }

    pub fn handle(&self, invoker: &dyn HandlerInvoker, ctx: &EventContext) -> TransferOutcome {
        let code = ctx.code;
        let outcome = if self.table.contains_code(code) {
            self.table.transfer(invoker, ctx, code)
        } else {
            TransferOutcome::Refused
        };

        if outcome.is_refused() {
            debug!("{} ({}) not dispatched", code_name(code), code);
            self.trace.emit(ctx, &format!("Another syscall: {code}"));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Declined, HandlerId};
    use crate::trace::TraceBuffer;
    use std::cell::RefCell;

    struct Recorder {
        ran: RefCell<Vec<HandlerId>>,
    }

    impl HandlerInvoker for Recorder {
        fn invoke(&self, handler: HandlerId, _ctx: &EventContext) -> Result<(), Declined> {
            self.ran.borrow_mut().push(handler);
            Ok(())
        }
    }

    fn probe_with(entries: &[(i64, HandlerId)]) -> (EntryProbe, Arc<TraceBuffer>) {
        let mut table = DispatchTable::default();
        for (code, handler) in entries {
            table.set(*code, *handler).unwrap();
        }
        let trace = Arc::new(TraceBuffer::default());
        (EntryProbe::new(Arc::new(table), trace.clone()), trace)
    }

    #[test]
    fn test_mapped_code_skips_fallback() {
        let exec = HandlerId::new(4);
        let (probe, trace) = probe_with(&[(59, exec)]);
        let recorder = Recorder {
            ran: RefCell::new(Vec::new()),
        };

        let ctx = EventContext::new(59).with_comm(b"bash");
        assert_eq!(probe.handle(&recorder, &ctx), TransferOutcome::Transferred);
        assert_eq!(*recorder.ran.borrow(), vec![exec]);
        assert!(trace.is_empty());
    }

    #[test]
    fn test_unmapped_code_falls_back() {
        let (probe, trace) = probe_with(&[(59, HandlerId::new(4))]);
        let recorder = Recorder {
            ran: RefCell::new(Vec::new()),
        };

        let ctx = EventContext::new(1).with_comm(b"bash");
        assert_eq!(probe.handle(&recorder, &ctx), TransferOutcome::Refused);
        assert!(recorder.ran.borrow().is_empty());

        let lines = trace.take();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "Another syscall: 1");
        assert_eq!(lines[0].comm, "bash");
    }

    #[test]
    fn test_out_of_range_code_never_looked_up() {
        let (probe, trace) = probe_with(&[]);
        let recorder = Recorder {
            ran: RefCell::new(Vec::new()),
        };

        for code in [-1, 300, 435] {
            let ctx = EventContext::new(code);
            assert!(probe.handle(&recorder, &ctx).is_refused());
        }
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn test_context_from_packed_ids() {
        let ctx = EventContext::new(59)
            .with_pid_tgid((4242u64 << 32) | 4243)
            .with_uid_gid((100u64 << 32) | 1000)
            .with_comm(b"a-very-long-command-name");
        assert_eq!(ctx.pid, 4242);
        assert_eq!(ctx.tid, 4243);
        assert_eq!(ctx.uid, 1000);
        assert_eq!(ctx.gid, 100);
        assert_eq!(ctx.comm(), "a-very-long-comm");
    }

    #[test]
    fn test_current_context() {
        let ctx = EventContext::current(0);
        assert_eq!(ctx.pid, std::process::id() as i32);
        assert_eq!(ctx.uid, unsafe { libc::getuid() });
        assert_eq!(ctx.tail_calls(), 0);
    }
}
