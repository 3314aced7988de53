use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use syscalls::Sysno;

/// The program type a handler was built as. A handler can only attach to an
/// event source of the same kind, and only transfer to handlers of its own
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Kprobe,
    RawTracepoint,
    Tracepoint,
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgramKind::Kprobe => "kprobe",
            ProgramKind::RawTracepoint => "raw_tp",
            ProgramKind::Tracepoint => "tracepoint",
        };
        write!(f, "{}", name)
    }
}

/// A named class of OS event a handler can be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttachPoint {
    Kprobe { func_name: String },
    RawTracepoint { name: String },
    Tracepoint { category: String, name: String },
}

impl AttachPoint {
    pub fn kprobe(func_name: &str) -> Self {
        AttachPoint::Kprobe {
            func_name: func_name.to_string(),
        }
    }

    /// Kprobe on the kernel entry function for the named syscall.
    pub fn syscall(name: &str) -> Result<Self> {
        let sysno = Sysno::from_str(name)
            .map_err(|_| anyhow::anyhow!("Unknown syscall: {}", name))?;
        Ok(AttachPoint::kprobe(&syscall_fnname(sysno)))
    }

    pub fn raw_tracepoint(name: &str) -> Self {
        AttachPoint::RawTracepoint {
            name: name.to_string(),
        }
    }

    pub fn kind(&self) -> ProgramKind {
        match self {
            AttachPoint::Kprobe { .. } => ProgramKind::Kprobe,
            AttachPoint::RawTracepoint { .. } => ProgramKind::RawTracepoint,
            AttachPoint::Tracepoint { .. } => ProgramKind::Tracepoint,
        }
    }

    /// The syscall this attach point fires for, if it is a syscall entry
    /// kprobe.
    pub fn syscall_number(&self) -> Option<i64> {
        let AttachPoint::Kprobe { func_name } = self else {
            return None;
        };
        let name = func_name.strip_prefix(SYSCALL_PREFIX)?;
        Sysno::from_str(name).ok().map(|s| s.id() as i64)
    }
}

impl FromStr for AttachPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // Format is
        // kprobe:<func>
        // syscall:<name>
        // raw_tp:<name>
        // tracepoint:<category>:<name>
        let parts = s.split(':').collect::<Vec<&str>>();
        match (parts[0], parts.len()) {
            ("kprobe", 2) if !parts[1].is_empty() => Ok(AttachPoint::kprobe(parts[1])),
            ("syscall", 2) => AttachPoint::syscall(parts[1]),
            ("raw_tp", 2) | ("raw_tracepoint", 2) if !parts[1].is_empty() => {
                Ok(AttachPoint::raw_tracepoint(parts[1]))
            }
            ("tracepoint", 3) if !parts[1].is_empty() && !parts[2].is_empty() => {
                Ok(AttachPoint::Tracepoint {
                    category: parts[1].to_string(),
                    name: parts[2].to_string(),
                })
            }
            _ => Err(anyhow::anyhow!("Invalid attach point: {}", s)),
        }
    }
}

impl fmt::Display for AttachPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachPoint::Kprobe { func_name } => write!(f, "kprobe:{}", func_name),
            AttachPoint::RawTracepoint { name } => write!(f, "raw_tp:{}", name),
            AttachPoint::Tracepoint { category, name } => {
                write!(f, "tracepoint:{}:{}", category, name)
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
const SYSCALL_PREFIX: &str = "__x64_sys_";
#[cfg(target_arch = "aarch64")]
const SYSCALL_PREFIX: &str = "__arm64_sys_";
#[cfg(target_arch = "riscv64")]
const SYSCALL_PREFIX: &str = "__riscv_sys_";
#[cfg(target_arch = "s390x")]
const SYSCALL_PREFIX: &str = "__s390x_sys_";
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64",
    target_arch = "s390x"
)))]
const SYSCALL_PREFIX: &str = "sys_";

/// Kernel function name of a syscall's entry point on this architecture.
pub fn syscall_fnname(sysno: Sysno) -> String {
    format!("{}{}", SYSCALL_PREFIX, sysno.name())
}

/// Parse an event code given either as a number or as a syscall name.
pub fn parse_code(s: &str) -> Result<i64> {
    if let Ok(code) = s.parse::<i64>() {
        return Ok(code);
    }
    Sysno::from_str(s)
        .map(|sysno| sysno.id() as i64)
        .map_err(|_| anyhow::anyhow!("Unknown syscall: {}", s))
}

/// Human readable name for an event code, falling back to the number.
pub fn code_name(code: i64) -> String {
    usize::try_from(code)
        .ok()
        .and_then(Sysno::new)
        .map(|sysno| sysno.name().to_string())
        .unwrap_or_else(|| format!("syscall_{}", code))
}
