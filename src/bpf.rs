//! Kernel substrate: handlers are the programs in `src/bpf/tailtrace.bpf.c`.
//!
//! The object is opened and loaded in one go, so verification happens for all
//! programs up front. After that `load` only resolves a program by name and
//! checks its type, and `attach` creates the link and keeps it alive for as
//! long as the substrate lives.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use libbpf_rs::{
    Link, MapCore, MapFlags, MapHandle, Object, ObjectBuilder, ProgramType, RingBuffer,
    RingBufferBuilder,
};
use log::{debug, warn};

use crate::attach::{AttachPoint, ProgramKind};
use crate::channel::TelemetrySource;
use crate::counter::CounterSource;
use crate::dispatch::{DispatchTable, HandlerId};
use crate::record::Record;
use crate::substrate::{LoadError, Substrate};

/// Ring buffer carrying `struct record`.
pub const OUTPUT_MAP: &str = "output";
/// Per-CPU count of records the ring buffer had no room for.
pub const DROPPED_MAP: &str = "dropped";
/// uid -> count
pub const COUNTER_MAP: &str = "counter_table";
/// libbpf names the zero initialised globals map `<object name>.bss`.
const BSS_SUFFIX: &str = ".bss";

/// 128MiB, plenty for the maps in our object on kernels that still charge BPF
/// memory against RLIMIT_MEMLOCK.
const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

#[cfg(feature = "embed-bpf")]
const EMBEDDED_OBJECT: Option<&[u8]> = Some(include_bytes!(concat!(
    env!("OUT_DIR"),
    "/tailtrace.bpf.o"
)));
#[cfg(not(feature = "embed-bpf"))]
const EMBEDDED_OBJECT: Option<&[u8]> = None;

pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} bytes ({} MiB). This is required for BPF programs.",
            MEMLOCK_RLIMIT_BYTES,
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }

    Ok(())
}

/// Deleting a slot that was never filled fails with ENOENT, which still leaves
/// it empty.
fn slot_cleared(res: libbpf_rs::Result<()>) -> libbpf_rs::Result<()> {
    match res {
        Err(e) if e.kind() == libbpf_rs::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

fn program_kind(prog_type: ProgramType) -> Option<ProgramKind> {
    match prog_type {
        ProgramType::Kprobe => Some(ProgramKind::Kprobe),
        ProgramType::RawTracepoint => Some(ProgramKind::RawTracepoint),
        ProgramType::Tracepoint => Some(ProgramKind::Tracepoint),
        _ => None,
    }
}

pub struct BpfSubstrate {
    object: Object,
    // Index is the HandlerId.
    loaded: Vec<(String, ProgramKind)>,
    attached: HashSet<AttachPoint>,
    links: Vec<Link>,
}

impl BpfSubstrate {
    /// Open and load the object at `path`, or the one built into the binary if
    /// no path is given.
    pub fn open(path: Option<&Path>, verbose: bool) -> Result<Self> {
        let mut obj_builder = ObjectBuilder::default();
        obj_builder.debug(verbose);

        let open_obj = match (path, EMBEDDED_OBJECT) {
            (Some(path), _) => obj_builder
                .open_file(path)
                .with_context(|| format!("Failed to open BPF object {}", path.display()))?,
            (None, Some(mem)) => obj_builder
                .open_memory(mem)
                .context("Failed to open embedded BPF object")?,
            (None, None) => bail!(
                "No BPF object available, pass --object or build with the embed-bpf feature"
            ),
        };
        let object = open_obj.load().context("Failed to load BPF object")?;

        for prog in object.progs() {
            debug!(
                "program {} type {:?}",
                prog.name().to_string_lossy(),
                prog.prog_type()
            );
        }

        Ok(BpfSubstrate {
            object,
            loaded: Vec::new(),
            attached: HashSet::new(),
            links: Vec::new(),
        })
    }

    fn map_handle(&self, name: &str) -> Result<MapHandle> {
        let map = self
            .object
            .maps()
            .find(|map| map.name() == OsStr::new(name))
            .ok_or_else(|| anyhow::anyhow!("Failed to find '{}' map", name))?;
        MapHandle::try_from(&map).with_context(|| format!("Failed to get a handle to '{}'", name))
    }

    fn program_fd(&self, handler: HandlerId) -> Result<i32> {
        let (name, _) = self
            .loaded
            .get(handler.raw() as usize)
            .ok_or(LoadError::UnknownHandler(handler))?;
        let prog = self
            .object
            .progs()
            .find(|prog| prog.name() == OsStr::new(name))
            .ok_or_else(|| LoadError::NotFound(name.clone()))?;
        Ok(prog.as_fd().as_raw_fd())
    }

    /// Write `table` into the program array `map_name`. Populated slots get the
    /// fd of their handler, every other slot is cleared.
    pub fn install_dispatch(&self, map_name: &str, table: &DispatchTable) -> Result<()> {
        let map = self.map_handle(map_name)?;
        let max_entries = map.max_entries() as usize;
        if table.capacity() > max_entries {
            bail!(
                "Dispatch table has {} slots but map '{}' only holds {}",
                table.capacity(),
                map_name,
                max_entries
            );
        }

        let mut installed = 0;
        for slot in 0..table.capacity() {
            let key = (slot as u32).to_ne_bytes();
            match table.resolve(slot as i64) {
                Some(handler) => {
                    let fd = self.program_fd(handler)?;
                    map.update(&key, &fd.to_ne_bytes(), MapFlags::ANY)
                        .with_context(|| {
                            format!("Failed to install {} at slot {}", handler, slot)
                        })?;
                    installed += 1;
                }
                None => {
                    slot_cleared(map.delete(&key))
                        .with_context(|| format!("Failed to clear slot {}", slot))?;
                }
            }
        }
        debug!("installed {} dispatch slots into '{}'", installed, map_name);
        Ok(())
    }

    /// Stream `struct record`s out of the ring buffer `map_name`, with drops
    /// read from the per-CPU counter `drop_map`.
    pub fn telemetry(&self, map_name: &str, drop_map: &str) -> Result<BpfTelemetry> {
        let map = self.map_handle(map_name)?;
        let dropped = self.map_handle(drop_map)?;

        let (tx, rx) = channel();
        let mut builder = RingBufferBuilder::new();
        builder.add(&map, move |data: &[u8]| {
            let Some(record) = Record::from_bytes(data) else {
                warn!("short record of {} bytes in ring buffer", data.len());
                return 0;
            };
            if tx.send(record).is_err() {
                // Receiver has been dropped, stop consuming.
                return -1;
            }
            0
        })?;
        let ring = builder.build()?;

        Ok(BpfTelemetry {
            ring,
            rx,
            dropped,
            _map: map,
        })
    }

    pub fn counters(&self, map_name: &str) -> Result<BpfCounters> {
        Ok(BpfCounters {
            map: self.map_handle(map_name)?,
        })
    }

    /// How many times `hello_counter` has run, read from the `hello_count`
    /// global.
    pub fn hello_count(&self) -> Result<u64> {
        let map = self
            .object
            .maps()
            .find(|map| map.name().to_string_lossy().ends_with(BSS_SUFFIX))
            .ok_or_else(|| anyhow::anyhow!("Object has no {} map", BSS_SUFFIX))?;
        let map = MapHandle::try_from(&map).context("Failed to get a handle to .bss")?;
        let section = map
            .lookup(&0u32.to_ne_bytes(), MapFlags::ANY)
            .context("Failed to read .bss")?
            .unwrap_or_default();
        // hello_count is the only variable in .bss.
        let Some(Ok(value)) = section.get(..8).map(<[u8; 8]>::try_from) else {
            bail!(".bss is {} bytes, too small for hello_count", section.len());
        };
        Ok(u64::from_ne_bytes(value))
    }

    pub fn links(&self) -> usize {
        self.links.len()
    }
}

impl Substrate for BpfSubstrate {
    fn load(&mut self, name: &str, attach: &AttachPoint) -> Result<HandlerId, LoadError> {
        let prog = self
            .object
            .progs()
            .find(|prog| prog.name() == OsStr::new(name))
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;

        let prog_type = prog.prog_type();
        let Some(kind) = program_kind(prog_type) else {
            return Err(LoadError::Verification {
                name: name.to_string(),
                reason: format!("unsupported program type {:?}", prog_type),
            });
        };
        if kind != attach.kind() {
            return Err(LoadError::KindMismatch {
                name: name.to_string(),
                found: kind,
                expected: attach.kind(),
                attach: attach.clone(),
            });
        }

        if let Some(idx) = self.loaded.iter().position(|(n, _)| n == name) {
            return Ok(HandlerId::new(idx as u32));
        }
        let id = HandlerId::new(self.loaded.len() as u32);
        self.loaded.push((name.to_string(), kind));
        debug!("resolved BPF program '{}' as {}", name, id);
        Ok(id)
    }

    fn attach(&mut self, handler: HandlerId, attach: &AttachPoint) -> Result<(), LoadError> {
        let Some((name, kind)) = self.loaded.get(handler.raw() as usize).cloned() else {
            return Err(LoadError::UnknownHandler(handler));
        };
        if kind != attach.kind() {
            return Err(LoadError::KindMismatch {
                name,
                found: kind,
                expected: attach.kind(),
                attach: attach.clone(),
            });
        }
        if self.attached.contains(attach) {
            return Err(LoadError::AlreadyAttached {
                attach: attach.clone(),
            });
        }

        let prog = self
            .object
            .progs_mut()
            .find(|prog| prog.name() == OsStr::new(&name))
            .ok_or_else(|| LoadError::NotFound(name.clone()))?;
        let link = match attach {
            AttachPoint::Kprobe { func_name } => prog.attach_kprobe(false, func_name),
            AttachPoint::RawTracepoint { name } => prog.attach_raw_tracepoint(name),
            AttachPoint::Tracepoint { category, name } => prog.attach_tracepoint(
                libbpf_rs::TracepointCategory::Custom(category.clone()),
                name,
            ),
        }
        .map_err(|e| LoadError::Attach {
            handler,
            attach: attach.clone(),
            reason: e.to_string(),
        })?;

        debug!("attached '{}' to {}", name, attach);
        self.links.push(link);
        self.attached.insert(attach.clone());
        Ok(())
    }
}

pub struct BpfTelemetry {
    ring: RingBuffer<'static>,
    rx: Receiver<Record>,
    dropped: MapHandle,
    // The ring buffer is registered on this fd, it has to stay open.
    _map: MapHandle,
}

impl TelemetrySource for BpfTelemetry {
    fn poll(&mut self, timeout: Duration, callback: &mut dyn FnMut(Record)) -> Result<usize> {
        if let Err(e) = self.ring.poll(timeout) {
            if e.kind() != libbpf_rs::ErrorKind::Interrupted {
                return Err(e).context("Failed to poll ring buffer");
            }
            debug!("ring buffer poll interrupted");
        }
        let mut count = 0;
        while let Ok(record) = self.rx.try_recv() {
            callback(record);
            count += 1;
        }
        Ok(count)
    }

    fn dropped(&self) -> u64 {
        let key = 0u32.to_ne_bytes();
        match self.dropped.lookup_percpu(&key, MapFlags::ANY) {
            Ok(Some(per_cpu)) => per_cpu
                .iter()
                .filter_map(|v| v.get(..8))
                .filter_map(|v| v.try_into().ok())
                .map(u64::from_ne_bytes)
                .sum(),
            Ok(None) => 0,
            Err(e) => {
                warn!("Failed to read drop counters: {}", e);
                0
            }
        }
    }
}

pub struct BpfCounters {
    map: MapHandle,
}

impl CounterSource for BpfCounters {
    fn snapshot(&self) -> Result<Vec<(u64, u64)>> {
        let mut entries = Vec::new();
        for key in self.map.keys() {
            let Some(value) = self.map.lookup(&key, MapFlags::ANY)? else {
                // Deleted between the key walk and the lookup.
                continue;
            };
            let (Ok(k), Ok(v)) = (
                <[u8; 8]>::try_from(key.as_slice()),
                <[u8; 8]>::try_from(value.as_slice()),
            ) else {
                bail!("Unexpected key/value size in counter map");
            };
            entries.push((u64::from_ne_bytes(k), u64::from_ne_bytes(v)));
        }
        entries.sort_unstable_by_key(|(k, _)| *k);
        Ok(entries)
    }
}
