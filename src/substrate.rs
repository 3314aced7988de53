//! The contract with whatever hosts handler code: load a named handler for an
//! attach point, and attach a loaded handler to an event source.

use crate::attach::{AttachPoint, ProgramKind};
use crate::dispatch::HandlerId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("no handler named '{0}'")]
    NotFound(String),
    #[error("handler '{name}' failed verification: {reason}")]
    Verification { name: String, reason: String },
    #[error("handler '{name}' is a {found} program, {attach} needs {expected}")]
    KindMismatch {
        name: String,
        found: ProgramKind,
        expected: ProgramKind,
        attach: AttachPoint,
    },
    #[error("cannot load '{name}': limit of {limit} handlers reached")]
    Exhausted { name: String, limit: usize },
    #[error("{0} is not a loaded handler")]
    UnknownHandler(HandlerId),
    #[error("{attach} already has a handler attached")]
    AlreadyAttached { attach: AttachPoint },
    #[error("failed to attach {handler} to {attach}: {reason}")]
    Attach {
        handler: HandlerId,
        attach: AttachPoint,
        reason: String,
    },
}

pub trait Substrate {
    /// Make the handler called `name` ready to run for events from `attach`.
    /// Loading the same name again returns the same identity.
    fn load(&mut self, name: &str, attach: &AttachPoint) -> Result<HandlerId, LoadError>;

    /// Install a loaded handler as the live entry for `attach`. At most one
    /// handler per event source.
    fn attach(&mut self, handler: HandlerId, attach: &AttachPoint) -> Result<(), LoadError>;
}
