//! Fixed layout telemetry record shared by producers and the consumer.
//!
//! The layout matches `struct record` in `src/bpf/tailtrace.bpf.c` byte for
//! byte, so records coming out of the kernel ring buffer are decoded with
//! [`plain::copy_from_bytes`] and records built in process are the same value.

use std::fmt;

use plain::Plain;

use crate::probe::EventContext;
use crate::utils::{copy_padded, cstr_lossy};

pub const COMMAND_LEN: usize = 16;
pub const MESSAGE_LEN: usize = 12;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub pid: i32,
    pub uid: u32,
    pub command: [u8; COMMAND_LEN],
    pub message: [u8; MESSAGE_LEN],
}

unsafe impl Plain for Record {}

// No padding: 4 + 4 + 16 + 12.
pub const RECORD_SIZE: usize = 36;
const _: () = assert!(std::mem::size_of::<Record>() == RECORD_SIZE);

impl Record {
    pub fn new(pid: i32, uid: u32, command: &[u8], message: &[u8]) -> Self {
        Record {
            pid,
            uid,
            command: copy_padded(command),
            message: copy_padded(message),
        }
    }

    /// Build a record for the task that triggered `ctx`.
    pub fn from_context(ctx: &EventContext, message: &[u8]) -> Self {
        Record {
            pid: ctx.pid,
            uid: ctx.uid,
            command: ctx.comm,
            message: copy_padded(message),
        }
    }

    /// Decode a record from raw ring buffer bytes.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let mut record = Record::default();
        plain::copy_from_bytes(&mut record, data).ok()?;
        Some(record)
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.uid.to_ne_bytes());
        buf[8..8 + COMMAND_LEN].copy_from_slice(&self.command);
        buf[8 + COMMAND_LEN..].copy_from_slice(&self.message);
        buf
    }

    pub fn command(&self) -> String {
        cstr_lossy(&self.command)
    }

    pub fn message(&self) -> String {
        cstr_lossy(&self.message)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.pid,
            self.uid,
            self.command(),
            self.message()
        )
    }
}
