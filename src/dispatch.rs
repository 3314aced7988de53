//! The dispatch table: event code -> handler identity, plus tail dispatch.
//!
//! The table only stores and resolves [`HandlerId`]s. Running a handler is the
//! job of whatever substrate issued the id, reached through [`HandlerInvoker`],
//! so the table itself can be exercised with fake ids and a fake invoker.
//!
//! A transfer replaces the caller's remaining work with the callee's. There is
//! no way to observe "the callee ran and then came back", so callers get a
//! [`TransferOutcome`] and must treat [`TransferOutcome::Refused`] as "nothing
//! ran" and take their own fallback path.

use std::fmt;

use crate::probe::EventContext;

/// Slot count used by the syscall dispatch demo, matching the prog array.
pub const DEFAULT_CAPACITY: usize = 300;

/// Longest chain of transfers allowed for one event. Same as the kernel's
/// MAX_TAIL_CALL_CNT.
pub const MAX_TAIL_CALLS: u32 = 33;

/// Opaque handle for a loaded handler, issued by a substrate's `load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u32);

impl HandlerId {
    pub const fn new(raw: u32) -> Self {
        HandlerId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("event code {code} outside dispatch table range [0, {capacity})")]
pub struct OutOfRange {
    pub code: i64,
    pub capacity: usize,
}

/// Returned by a handler that did not take the event, or by an invoker that
/// cannot run the handler it was given.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("handler {0} declined the event")]
pub struct Declined(pub HandlerId);

/// Runs loaded handlers on behalf of the dispatch table.
pub trait HandlerInvoker {
    fn invoke(&self, handler: HandlerId, ctx: &EventContext) -> Result<(), Declined>;
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The resolved handler ran in place of the caller.
    Transferred,
    /// No handler ran: empty slot, out of range code, the callee declined, or
    /// the chain limit was hit.
    Refused,
}

impl TransferOutcome {
    pub fn is_refused(self) -> bool {
        self == TransferOutcome::Refused
    }
}

#[derive(Debug, Clone)]
pub struct DispatchTable {
    slots: Box<[Option<HandlerId>]>,
}

impl DispatchTable {
    pub fn new(capacity: usize) -> Self {
        DispatchTable {
            slots: vec![None; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, code: i64) -> Option<usize> {
        usize::try_from(code)
            .ok()
            .filter(|idx| *idx < self.slots.len())
    }

    pub fn contains_code(&self, code: i64) -> bool {
        self.index(code).is_some()
    }

    fn out_of_range(&self, code: i64) -> OutOfRange {
        OutOfRange {
            code,
            capacity: self.capacity(),
        }
    }

    pub fn set(&mut self, code: i64, handler: HandlerId) -> Result<(), OutOfRange> {
        let idx = self.index(code).ok_or_else(|| self.out_of_range(code))?;
        self.slots[idx] = Some(handler);
        Ok(())
    }

    /// Empty a slot, returning what was there.
    pub fn clear(&mut self, code: i64) -> Result<Option<HandlerId>, OutOfRange> {
        let idx = self.index(code).ok_or_else(|| self.out_of_range(code))?;
        Ok(self.slots[idx].take())
    }

    /// Point every empty slot at `handler`. Returns how many slots changed.
    pub fn fill_unset(&mut self, handler: HandlerId) -> usize {
        let mut filled = 0;
        for slot in self.slots.iter_mut().filter(|s| s.is_none()) {
            *slot = Some(handler);
            filled += 1;
        }
        filled
    }

    pub fn resolve(&self, code: i64) -> Option<HandlerId> {
        self.index(code).and_then(|idx| self.slots[idx])
    }

    /// Populated slots in code order.
    pub fn entries(&self) -> impl Iterator<Item = (i64, HandlerId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(code, slot)| slot.map(|h| (code as i64, h)))
    }

    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Hand `ctx` to the handler installed at `code`.
    pub fn transfer(
        &self,
        invoker: &dyn HandlerInvoker,
        ctx: &EventContext,
        code: i64,
    ) -> TransferOutcome {
        let Some(handler) = self.resolve(code) else {
            return TransferOutcome::Refused;
        };
        if !ctx.enter_tail_call() {
            return TransferOutcome::Refused;
        }
        match invoker.invoke(handler, ctx) {
            Ok(()) => TransferOutcome::Transferred,
            Err(_) => TransferOutcome::Refused,
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const EXEC: HandlerId = HandlerId::new(1);
    const TIMER: HandlerId = HandlerId::new(2);
    const IGNORE: HandlerId = HandlerId::new(3);

    /// Records every invocation and declines anything it was told to.
    #[derive(Default)]
    struct FakeInvoker {
        calls: RefCell<Vec<(HandlerId, i64)>>,
        decline: Option<HandlerId>,
    }

    impl HandlerInvoker for FakeInvoker {
        fn invoke(&self, handler: HandlerId, ctx: &EventContext) -> Result<(), Declined> {
            if self.decline == Some(handler) {
                return Err(Declined(handler));
            }
            self.calls.borrow_mut().push((handler, ctx.code));
            Ok(())
        }
    }

    #[test]
    fn test_set_resolve_every_code() {
        let mut table = DispatchTable::new(DEFAULT_CAPACITY);
        for code in 0..DEFAULT_CAPACITY as i64 {
            assert_eq!(table.resolve(code), None);
            let handler = HandlerId::new(code as u32 + 100);
            table.set(code, handler).unwrap();
            assert_eq!(table.resolve(code), Some(handler));
        }
        assert_eq!(table.populated(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_unset_codes_resolve_none() {
        let mut table = DispatchTable::default();
        table.set(59, EXEC).unwrap();
        for code in (0..DEFAULT_CAPACITY as i64).filter(|c| *c != 59) {
            assert_eq!(table.resolve(code), None);
        }
    }

    #[test]
    fn test_out_of_range_set_leaves_table_unchanged() {
        let mut table = DispatchTable::new(10);
        table.set(3, EXEC).unwrap();
        let before: Vec<_> = table.entries().collect();

        for code in [-1, 10, 11, i64::MAX, i64::MIN] {
            assert_eq!(
                table.set(code, TIMER),
                Err(OutOfRange { code, capacity: 10 })
            );
            assert_eq!(table.resolve(code), None);
        }
        assert_eq!(table.entries().collect::<Vec<_>>(), before);
    }

    #[test]
    fn test_shared_handler_identity() {
        let mut table = DispatchTable::default();
        for code in 222..=226 {
            table.set(code, TIMER).unwrap();
        }
        let resolved: Vec<_> = (222..=226).map(|c| table.resolve(c)).collect();
        assert!(resolved.iter().all(|h| *h == Some(TIMER)));
    }

    #[test]
    fn test_fill_unset_and_clear() {
        let mut table = DispatchTable::new(8);
        table.set(2, EXEC).unwrap();
        assert_eq!(table.fill_unset(IGNORE), 7);
        assert_eq!(table.resolve(2), Some(EXEC));
        assert_eq!(table.resolve(5), Some(IGNORE));

        assert_eq!(table.clear(5), Ok(Some(IGNORE)));
        assert_eq!(table.resolve(5), None);
        assert_eq!(table.clear(5), Ok(None));
        assert!(table.clear(8).is_err());
    }

    #[test]
    fn test_transfer_scenario() {
        let mut table = DispatchTable::default();
        table.set(59, EXEC).unwrap();
        table.set(222, TIMER).unwrap();
        let invoker = FakeInvoker::default();

        let ctx = EventContext::new(59);
        assert_eq!(
            table.transfer(&invoker, &ctx, 59),
            TransferOutcome::Transferred
        );
        let ctx = EventContext::new(1);
        assert_eq!(table.transfer(&invoker, &ctx, 1), TransferOutcome::Refused);
        let ctx = EventContext::new(-4);
        assert_eq!(table.transfer(&invoker, &ctx, -4), TransferOutcome::Refused);

        assert_eq!(*invoker.calls.borrow(), vec![(EXEC, 59)]);
    }

    #[test]
    fn test_transfer_declined_is_refused() {
        let mut table = DispatchTable::default();
        table.set(59, EXEC).unwrap();
        let invoker = FakeInvoker {
            decline: Some(EXEC),
            ..Default::default()
        };
        let ctx = EventContext::new(59);
        assert!(table.transfer(&invoker, &ctx, 59).is_refused());
        assert!(invoker.calls.borrow().is_empty());
    }

    #[test]
    fn test_transfer_chain_limit() {
        let mut table = DispatchTable::default();
        table.set(7, EXEC).unwrap();
        let invoker = FakeInvoker::default();
        let ctx = EventContext::new(7);

        for _ in 0..MAX_TAIL_CALLS {
            assert_eq!(
                table.transfer(&invoker, &ctx, 7),
                TransferOutcome::Transferred
            );
        }
        assert_eq!(table.transfer(&invoker, &ctx, 7), TransferOutcome::Refused);
        assert_eq!(invoker.calls.borrow().len(), MAX_TAIL_CALLS as usize);
    }
}
