//! In-process substrate: handlers are Rust closures.
//!
//! This gives the dispatch engine the same load/attach/transfer life cycle it
//! has against the kernel without needing privileges, which is what the
//! `simulate` command and the integration tests run on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::attach::{AttachPoint, ProgramKind};
use crate::dispatch::{Declined, HandlerId, HandlerInvoker};
use crate::probe::EventContext;
use crate::substrate::{LoadError, Substrate};

/// Default cap on loaded handlers, generous next to the handful any command
/// loads.
pub const DEFAULT_MAX_HANDLERS: usize = 64;

/// Handler body. The invoker lets a handler transfer onwards through a
/// dispatch table of its own.
pub type NativeFn =
    Arc<dyn Fn(&EventContext, &dyn HandlerInvoker) -> Result<(), Declined> + Send + Sync>;

#[derive(Clone)]
pub struct NativeProgram {
    pub kind: ProgramKind,
    pub body: NativeFn,
}

impl NativeProgram {
    pub fn new<F>(kind: ProgramKind, body: F) -> Self
    where
        F: Fn(&EventContext, &dyn HandlerInvoker) -> Result<(), Declined> + Send + Sync + 'static,
    {
        NativeProgram {
            kind,
            body: Arc::new(body),
        }
    }
}

struct LoadedHandler {
    name: String,
    body: NativeFn,
}

/// The loaded handler set. Cheap to clone, shared with whoever needs to
/// invoke handlers.
#[derive(Clone, Default)]
pub struct NativeHandlers {
    loaded: Arc<RwLock<Vec<LoadedHandler>>>,
}

impl NativeHandlers {
    fn body(&self, handler: HandlerId) -> Option<NativeFn> {
        let loaded = self.loaded.read().unwrap();
        loaded
            .get(handler.raw() as usize)
            .map(|h| h.body.clone())
    }

    pub fn name(&self, handler: HandlerId) -> Option<String> {
        let loaded = self.loaded.read().unwrap();
        loaded.get(handler.raw() as usize).map(|h| h.name.clone())
    }

    pub fn len(&self) -> usize {
        self.loaded.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HandlerInvoker for NativeHandlers {
    fn invoke(&self, handler: HandlerId, ctx: &EventContext) -> Result<(), Declined> {
        // Clone the body out so the lock isn't held while the handler runs and
        // possibly transfers again.
        let body = self.body(handler).ok_or(Declined(handler))?;
        body(ctx, self)
    }
}

pub struct NativeSubstrate {
    sources: HashMap<String, NativeProgram>,
    by_name: HashMap<String, (HandlerId, ProgramKind)>,
    handlers: NativeHandlers,
    attached: HashMap<AttachPoint, HandlerId>,
    max_handlers: usize,
}

impl NativeSubstrate {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_HANDLERS)
    }

    pub fn with_limit(max_handlers: usize) -> Self {
        NativeSubstrate {
            sources: HashMap::new(),
            by_name: HashMap::new(),
            handlers: NativeHandlers::default(),
            attached: HashMap::new(),
            max_handlers,
        }
    }

    /// Make a handler available to `load` under `name`.
    pub fn register(&mut self, name: &str, program: NativeProgram) {
        self.sources.insert(name.to_string(), program);
    }

    pub fn handlers(&self) -> NativeHandlers {
        self.handlers.clone()
    }

    pub fn attached(&self, attach: &AttachPoint) -> Option<HandlerId> {
        self.attached.get(attach).copied()
    }

    pub fn attach_points(&self) -> impl Iterator<Item = &AttachPoint> {
        self.attached.keys()
    }

    /// Fire `attach` for one event. Returns false if nothing is attached there.
    pub fn deliver(&self, attach: &AttachPoint, ctx: &EventContext) -> bool {
        let Some(handler) = self.attached(attach) else {
            return false;
        };
        if let Err(e) = self.handlers.invoke(handler, ctx) {
            debug!("entry handler for {} did not run: {}", attach, e);
        }
        true
    }
}

impl Default for NativeSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl Substrate for NativeSubstrate {
    fn load(&mut self, name: &str, attach: &AttachPoint) -> Result<HandlerId, LoadError> {
        if let Some((id, kind)) = self.by_name.get(name) {
            if *kind != attach.kind() {
                return Err(LoadError::KindMismatch {
                    name: name.to_string(),
                    found: *kind,
                    expected: attach.kind(),
                    attach: attach.clone(),
                });
            }
            return Ok(*id);
        }

        let program = self
            .sources
            .get(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        if program.kind != attach.kind() {
            return Err(LoadError::KindMismatch {
                name: name.to_string(),
                found: program.kind,
                expected: attach.kind(),
                attach: attach.clone(),
            });
        }

        let mut loaded = self.handlers.loaded.write().unwrap();
        if loaded.len() >= self.max_handlers {
            return Err(LoadError::Exhausted {
                name: name.to_string(),
                limit: self.max_handlers,
            });
        }
        let id = HandlerId::new(loaded.len() as u32);
        loaded.push(LoadedHandler {
            name: name.to_string(),
            body: program.body.clone(),
        });
        drop(loaded);

        debug!("loaded native handler '{}' as {}", name, id);
        self.by_name.insert(name.to_string(), (id, program.kind));
        Ok(id)
    }

    fn attach(&mut self, handler: HandlerId, attach: &AttachPoint) -> Result<(), LoadError> {
        let Some(name) = self.handlers.name(handler) else {
            return Err(LoadError::UnknownHandler(handler));
        };
        let (_, kind) = self.by_name[&name];
        if kind != attach.kind() {
            return Err(LoadError::KindMismatch {
                name,
                found: kind,
                expected: attach.kind(),
                attach: attach.clone(),
            });
        }
        if self.attached.contains_key(attach) {
            return Err(LoadError::AlreadyAttached {
                attach: attach.clone(),
            });
        }
        debug!("attached '{}' to {}", name, attach);
        self.attached.insert(attach.clone(), handler);
        Ok(())
    }
}
