use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use syscalls::Sysno;

use crate::attach::{parse_code, AttachPoint};
use crate::dispatch::{DispatchTable, HandlerId, DEFAULT_CAPACITY};
use crate::handlers::{HELLO_DISPATCH, HELLO_EXECVE, HELLO_TIMER, IGNORE_OPCODE};
use crate::substrate::Substrate;

/// How often the counter table is printed.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Records buffered for the poll loop before producers start dropping.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Name of the program array map backing the dispatch table.
pub const DISPATCH_MAP: &str = "syscall";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dispatch capacity must be at least 1")]
    ZeroCapacity,
    #[error("dispatch capacity {capacity} exceeds the maximum of {max}")]
    CapacityTooLarge { capacity: usize, max: usize },
    #[error("invalid entry attach point '{0}'")]
    InvalidAttach(String),
    #[error("unknown code '{code}' for handler '{handler}'")]
    UnknownCode { handler: String, code: String },
    #[error("code {code} routed to both '{first}' and '{second}'")]
    DuplicateCode {
        code: i64,
        first: String,
        second: String,
    },
}

// The dispatch config file looks like
//
// {
//   "capacity": 300,
//   "entry": "hello_dispatch",
//   "attach": "raw_tp:sys_enter",
//   "default": "ignore_opcode",
//   "routes": [
//     { "handler": "hello_execve", "codes": ["execve"] },
//     { "handler": "hello_timer", "codes": [222, "timer_settime", 224] }
//   ]
// }
//
// Codes are syscall numbers or syscall names for the running architecture.
// "default" fills every slot no route claimed, leave it out to keep those slots
// empty so the entry probe logs them.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct DispatchJSONConfig {
    capacity: Option<usize>,
    entry: Option<String>,
    attach: Option<String>,
    default: Option<String>,
    routes: Vec<DispatchJSONRoute>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct DispatchJSONRoute {
    handler: String,
    codes: Vec<DispatchJSONCode>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum DispatchJSONCode {
    Number(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub handler: String,
    pub codes: Vec<i64>,
}

/// Which handler goes in which dispatch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub capacity: usize,
    pub entry: String,
    pub attach: AttachPoint,
    pub default: Option<String>,
    pub routes: Vec<Route>,
}

impl Default for DispatchPlan {
    /// execve goes to `hello_execve`, the timer syscalls share `hello_timer`,
    /// and everything else is silenced with `ignore_opcode`.
    fn default() -> Self {
        let timers = [
            Sysno::timer_create,
            Sysno::timer_settime,
            Sysno::timer_gettime,
            Sysno::timer_getoverrun,
            Sysno::timer_delete,
        ];
        DispatchPlan {
            capacity: DEFAULT_CAPACITY,
            entry: HELLO_DISPATCH.to_string(),
            attach: AttachPoint::raw_tracepoint("sys_enter"),
            default: Some(IGNORE_OPCODE.to_string()),
            routes: vec![
                Route {
                    handler: HELLO_EXECVE.to_string(),
                    codes: vec![Sysno::execve.id() as i64],
                },
                Route {
                    handler: HELLO_TIMER.to_string(),
                    codes: timers.iter().map(|s| s.id() as i64).collect(),
                },
            ],
        }
    }
}

impl DispatchPlan {
    pub fn from_json(buf: &str) -> Result<Self> {
        let config: DispatchJSONConfig = serde_json::from_str(buf)?;
        let mut plan = DispatchPlan::default();

        if let Some(capacity) = config.capacity {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity.into());
            }
            // The BPF prog array is sized at compile time.
            if capacity > DEFAULT_CAPACITY {
                return Err(ConfigError::CapacityTooLarge {
                    capacity,
                    max: DEFAULT_CAPACITY,
                }
                .into());
            }
            plan.capacity = capacity;
        }
        if let Some(entry) = config.entry {
            plan.entry = entry;
        }
        if let Some(attach) = config.attach {
            plan.attach = attach
                .parse()
                .map_err(|_| ConfigError::InvalidAttach(attach.clone()))?;
        }
        plan.default = config.default;

        plan.routes = Vec::with_capacity(config.routes.len());
        for route in config.routes {
            let mut codes = Vec::with_capacity(route.codes.len());
            for code in route.codes {
                codes.push(match code {
                    DispatchJSONCode::Number(n) => n,
                    DispatchJSONCode::Name(name) => {
                        parse_code(&name).map_err(|_| ConfigError::UnknownCode {
                            handler: route.handler.clone(),
                            code: name.clone(),
                        })?
                    }
                });
            }
            plan.routes.push(Route {
                handler: route.handler,
                codes,
            });
        }

        let mut claimed: HashMap<i64, &str> = HashMap::new();
        for route in plan.routes.iter() {
            for code in route.codes.iter() {
                if let Some(first) = claimed.insert(*code, &route.handler) {
                    return Err(ConfigError::DuplicateCode {
                        code: *code,
                        first: first.to_string(),
                        second: route.handler.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("Failed to read dispatch config {}", path.display()))?;
        Self::from_json(&buf)
            .with_context(|| format!("Failed to parse dispatch config {}", path.display()))
    }

    /// Load every routed handler through `substrate` and fill a table with
    /// them. Handlers are loaded once and share their identity across every
    /// slot they are routed to.
    pub fn build_table<S: Substrate>(&self, substrate: &mut S) -> Result<DispatchTable> {
        let mut table = DispatchTable::new(self.capacity);
        let mut loaded: HashMap<&str, HandlerId> = HashMap::new();

        for route in self.routes.iter() {
            let handler = match loaded.get(route.handler.as_str()) {
                Some(handler) => *handler,
                None => {
                    let handler = substrate
                        .load(&route.handler, &self.attach)
                        .with_context(|| format!("Failed to load handler '{}'", route.handler))?;
                    loaded.insert(&route.handler, handler);
                    handler
                }
            };
            for code in route.codes.iter() {
                table.set(*code, handler).with_context(|| {
                    format!("Failed to route code {} to '{}'", code, route.handler)
                })?;
            }
        }

        if let Some(default) = &self.default {
            let handler = match loaded.get(default.as_str()) {
                Some(handler) => *handler,
                None => substrate
                    .load(default, &self.attach)
                    .with_context(|| format!("Failed to load default handler '{}'", default))?,
            };
            let filled = table.fill_unset(handler);
            debug!("default handler '{}' fills {} slots", default, filled);
        }
        Ok(table)
    }
}

/// Resolved options shared by every command.
#[derive(Debug, Clone)]
pub struct Config {
    pub verbose: bool,
    pub object: Option<PathBuf>,
    /// Replaces the command's own event sources when not empty.
    pub attach: Vec<AttachPoint>,
    pub interval: Duration,
    pub channel_capacity: usize,
    pub plan: DispatchPlan,
}

impl Config {
    /// The event sources to use, `defaults` unless overridden.
    pub fn attach_points(&self, defaults: &[&str]) -> Result<Vec<AttachPoint>> {
        if !self.attach.is_empty() {
            return Ok(self.attach.clone());
        }
        defaults.iter().map(|s| s.parse()).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbose: false,
            object: None,
            attach: Vec::new(),
            interval: DEFAULT_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            plan: DispatchPlan::default(),
        }
    }
}
