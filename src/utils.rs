//! Helpers for the packed identity values the kernel hands to probes.
//!
//! `bpf_get_current_pid_tgid()` returns a u64 where:
//! - Lower 32 bits: TID (Thread ID)
//! - Upper 32 bits: TGID (Thread Group ID, which is the Process ID)
//!
//! `bpf_get_current_uid_gid()` packs the same way with the UID in the lower
//! 32 bits and the GID in the upper 32 bits.

/// Extract TID (Thread ID) from combined tgidpid value.
///
/// # Examples
///
/// ```
/// use tailtrace::utils::tid_from_tgidpid;
///
/// let tgidpid: u64 = 0x0000_1234_0000_5678;
/// assert_eq!(tid_from_tgidpid(tgidpid), 0x5678);
/// ```
#[inline(always)]
pub const fn tid_from_tgidpid(tgidpid: u64) -> i32 {
    (tgidpid & 0xFFFFFFFF) as i32
}

/// Extract PID (Process ID / TGID) from combined tgidpid value.
///
/// # Examples
///
/// ```
/// use tailtrace::utils::pid_from_tgidpid;
///
/// let tgidpid: u64 = 0x0000_1234_0000_5678;
/// assert_eq!(pid_from_tgidpid(tgidpid), 0x1234);
/// ```
#[inline(always)]
pub const fn pid_from_tgidpid(tgidpid: u64) -> i32 {
    (tgidpid >> 32) as i32
}

/// Extract the UID from a combined uid/gid value.
#[inline(always)]
pub const fn uid_from_uidgid(uidgid: u64) -> u32 {
    (uidgid & 0xFFFFFFFF) as u32
}

/// Extract the GID from a combined uid/gid value.
#[inline(always)]
pub const fn gid_from_uidgid(uidgid: u64) -> u32 {
    (uidgid >> 32) as u32
}

/// Copy `src` into a fixed, nul padded buffer, truncating if it does not fit.
pub fn copy_padded<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    let len = src.len().min(N);
    buf[..len].copy_from_slice(&src[..len]);
    buf
}

/// Decode a nul padded buffer, stopping at the first NUL.
pub fn cstr_lossy(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}
