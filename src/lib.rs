//! tailtrace - syscall dispatch through BPF tail calls, plus the telemetry
//! paths that go with it.
//!
//! A single entry probe sits on `sys_enter` and jumps through a program array
//! indexed by syscall number. Handlers report back through a ring buffer of
//! fixed size records, a hash map of counters, or the debug trace pipe.
//!
//! The routing and aggregation logic does not care what hosts the handlers:
//! the [`bpf`] substrate loads them into the kernel with libbpf-rs, the
//! [`native`] substrate runs Rust versions of them in process.
//!
//! # Modules
//!
//! - [`dispatch`] - The dispatch table and tail transfer
//! - [`probe`] - Event context and the entry probe
//! - [`channel`] - Bounded telemetry channel with drop accounting
//! - [`counter`] - Concurrent per-key counters
//! - [`poll`] - The consumer loop and console output
//! - [`config`] - Dispatch plans and command options
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tailtrace::channel::TelemetryChannel;
//! use tailtrace::config::DispatchPlan;
//! use tailtrace::counter::CounterStore;
//! use tailtrace::handlers::{register_all, register_entry, HandlerSinks};
//! use tailtrace::native::NativeSubstrate;
//! use tailtrace::probe::EventContext;
//! use tailtrace::trace::TraceBuffer;
//! use tailtrace::Substrate;
//!
//! let trace = Arc::new(TraceBuffer::default());
//! let (output, _consumer) = TelemetryChannel::bounded(64);
//! let sinks = HandlerSinks {
//!     trace: trace.clone(),
//!     output,
//!     counters: Arc::new(CounterStore::new()),
//!     hello_count: Default::default(),
//! };
//!
//! let plan = DispatchPlan::default();
//! let mut substrate = NativeSubstrate::new();
//! register_all(&mut substrate, &sinks);
//! let table = Arc::new(plan.build_table(&mut substrate).unwrap());
//! register_entry(&mut substrate, &plan.entry, table, trace.clone());
//! let entry = substrate.load(&plan.entry, &plan.attach).unwrap();
//! substrate.attach(entry, &plan.attach).unwrap();
//!
//! // execve, as the calling thread
//! substrate.deliver(&plan.attach, &EventContext::current(59));
//! for line in trace.take() {
//!     println!("{}", line);
//! }
//! ```

pub mod attach;
pub mod bpf;
pub mod channel;
pub mod cmds;
pub mod config;
pub mod counter;
pub mod dispatch;
pub mod handlers;
pub mod native;
pub mod poll;
pub mod probe;
pub mod record;
pub mod substrate;
pub mod trace;
pub mod trace_pipe;
pub mod utils;

// Re-export for convenience
pub use attach::{AttachPoint, ProgramKind};
pub use config::{Config, DispatchPlan};
pub use dispatch::{DispatchTable, HandlerId, HandlerInvoker, OutOfRange, TransferOutcome};
pub use substrate::{LoadError, Substrate};
