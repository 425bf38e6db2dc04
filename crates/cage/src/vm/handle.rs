//! Host-held roots for guest values.
//!
//! Guest values only stay alive across host suspension points while rooted.
//! The [`HandleTable`] is the per-evaluation root set: each [`Saved`] owns
//! one slot, duplication allocates another slot, and disposal frees the
//! slot for reuse. [`HandleTable::clear`] drops every root at once and must
//! run while the runtime is still alive; afterwards any straggling `Saved`
//! fails to restore instead of dangling.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rquickjs::{Ctx, Persistent, Value};

use crate::scope::ScopeDispose;

#[derive(Clone, Default)]
pub struct HandleTable {
    slots: Rc<RefCell<Slots>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Option<Persistent<Value<'static>>>>,
    free: Vec<u32>,
}

impl Slots {
    fn insert(&mut self, value: Persistent<Value<'static>>) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.entries[slot as usize] = Some(value);
            slot
        } else {
            let slot = u32::try_from(self.entries.len()).expect("handle table overflow");
            self.entries.push(Some(value));
            slot
        }
    }

    fn remove(&mut self, slot: u32) {
        if let Some(entry) = self.entries.get_mut(slot as usize) {
            if entry.take().is_some() {
                self.free.push(slot);
            }
        }
    }
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root a guest value and return its owning handle.
    pub fn save<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> Saved {
        let persistent = Persistent::save(ctx, value);
        let slot = self.slots.borrow_mut().insert(persistent);
        Saved {
            inner: Rc::new(SavedInner {
                table: self.clone(),
                slot,
                disposed: Cell::new(false),
            }),
        }
    }

    /// Number of live roots.
    #[must_use]
    pub fn live(&self) -> usize {
        let slots = self.slots.borrow();
        slots.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Drop every root. Must run while the runtime is still alive.
    pub fn clear(&self) {
        let mut slots = self.slots.borrow_mut();
        slots.entries.clear();
        slots.free.clear();
    }
}

/// An owned root for a guest value, restorable inside any context section
/// of the same evaluation.
#[derive(Clone)]
pub struct Saved {
    inner: Rc<SavedInner>,
}

impl std::fmt::Debug for Saved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saved").field("slot", &self.inner.slot).finish()
    }
}

struct SavedInner {
    table: HandleTable,
    slot: u32,
    disposed: Cell<bool>,
}

impl Saved {
    /// Rehydrate the rooted value inside a context section.
    ///
    /// # Errors
    /// Fails if the handle was disposed or the evaluation already tore down.
    pub fn restore<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        let slots = self.inner.table.slots.borrow();
        let persistent = slots
            .entries
            .get(self.inner.slot as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                rquickjs::Error::new_from_js_message("handle", "value", "handle is disposed")
            })?;
        persistent.clone().restore(ctx)
    }

    /// Duplicate the root: the value gains an additional owner that must be
    /// disposed independently.
    pub fn dup(&self) -> rquickjs::Result<Saved> {
        let mut slots = self.inner.table.slots.borrow_mut();
        let persistent = slots
            .entries
            .get(self.inner.slot as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| {
                rquickjs::Error::new_from_js_message("handle", "value", "handle is disposed")
            })?;
        let slot = slots.insert(persistent);
        Ok(Saved {
            inner: Rc::new(SavedInner {
                table: self.inner.table.clone(),
                slot,
                disposed: Cell::new(false),
            }),
        })
    }

    #[must_use]
    pub fn alive(&self) -> bool {
        if self.inner.disposed.get() {
            return false;
        }
        let slots = self.inner.table.slots.borrow();
        slots
            .entries
            .get(self.inner.slot as usize)
            .is_some_and(Option::is_some)
    }

    /// Release the root. Disposing twice is a programming error: fatal in
    /// debug builds, a no-op in release builds.
    pub fn dispose(&self) {
        debug_assert!(!self.inner.disposed.get(), "handle disposed twice");
        self.release();
    }

    /// Idempotent release, used by scope teardown and settlement paths that
    /// may race a manual dispose.
    pub(crate) fn release(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        self.inner.table.slots.borrow_mut().remove(self.inner.slot);
    }
}

impl ScopeDispose for Saved {
    fn dispose_scoped(&self) -> anyhow::Result<()> {
        self.release();
        Ok(())
    }
}
