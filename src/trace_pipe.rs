//! Reader for the kernel's `trace_pipe`, where `bpf_printk` output ends up.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::trace::{TraceLine, TraceSource};

const TRACE_PIPE_PATHS: [&str; 2] = [
    "/sys/kernel/tracing/trace_pipe",
    "/sys/kernel/debug/tracing/trace_pipe",
];

pub struct TracePipe {
    reader: BufReader<File>,
    path: PathBuf,
    partial: String,
}

impl TracePipe {
    /// Open the first `trace_pipe` that exists, tracefs first.
    pub fn open() -> Result<Self> {
        for path in TRACE_PIPE_PATHS.iter().map(Path::new) {
            if path.exists() {
                return Self::open_path(path);
            }
        }
        bail!(
            "Could not find trace_pipe, is tracefs mounted? Tried {}",
            TRACE_PIPE_PATHS.join(", ")
        );
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(TracePipe {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            partial: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSource for TracePipe {
    fn drain(&mut self, callback: &mut dyn FnMut(TraceLine)) -> Result<usize> {
        let mut count = 0;
        loop {
            match self.reader.read_line(&mut self.partial) {
                Ok(0) => break,
                Ok(_) => {
                    // A line cut short by EAGAIN is finished on the next drain.
                    if !self.partial.ends_with('\n') {
                        continue;
                    }
                    if let Some(line) = TraceLine::parse(&self.partial) {
                        callback(line);
                        count += 1;
                    }
                    self.partial.clear();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
                }
            }
        }
        Ok(count)
    }
}
