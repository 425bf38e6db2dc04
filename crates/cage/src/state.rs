//! Per-evaluation shared state.
//!
//! One [`EvalState`] is created per `run_code` and shared (via `Rc`) between
//! the runtime, the module contexts, and every sandbox-function closure
//! installed into the guest. It carries the handle table, the pending host
//! operations awaiting the pump, the after-script hooks, and the receiver
//! registry used for `this`-bound capability state.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;

use anyhow::anyhow;
use futures::future::LocalBoxFuture;
use rquickjs::Ctx;

use crate::error::CageError;
use crate::value::HostValue;
use crate::vm::{FetchFn, HandleTable, ResolveFn, Saved};

/// Callback delivered into the guest when a host operation completes.
pub(crate) type GuestCallback = Box<dyn for<'js> FnOnce(&Ctx<'js>) -> Result<(), CageError>>;

/// After-script hook; runs inside a context section after the first drain.
pub(crate) type Hook = Box<dyn for<'js> FnOnce(&Ctx<'js>) -> anyhow::Result<()>>;

/// What a completed host operation wants from the pump.
pub(crate) enum Completion {
    /// Settle a bridged guest promise with the marshalled outcome.
    Settle {
        resolve: Saved,
        reject: Saved,
        outcome: Result<HostValue, HostValue>,
    },
    /// Re-enter the guest with an arbitrary callback.
    Run(GuestCallback),
    /// Nothing to deliver; the operation only gated completion.
    Retired,
}

pub(crate) type PendingOp = LocalBoxFuture<'static, Completion>;

pub(crate) struct EvalState {
    pub(crate) table: HandleTable,
    spawned: RefCell<Vec<PendingOp>>,
    hooks: RefCell<Vec<Hook>>,
    receivers: RefCell<Vec<Option<Box<dyn Any>>>>,
    loader_request: RefCell<Option<(ResolveFn, FetchFn)>>,
}

impl EvalState {
    pub(crate) fn new(table: HandleTable) -> Self {
        Self {
            table,
            spawned: RefCell::new(Vec::new()),
            hooks: RefCell::new(Vec::new()),
            receivers: RefCell::new(Vec::new()),
            loader_request: RefCell::new(None),
        }
    }

    /// Register a host operation for the pump to await. The evaluation will
    /// not complete until the operation's future settles.
    pub(crate) fn push_op(&self, op: impl Future<Output = Completion> + 'static) {
        self.spawned.borrow_mut().push(Box::pin(op));
    }

    pub(crate) fn take_ops(&self) -> Vec<PendingOp> {
        std::mem::take(&mut self.spawned.borrow_mut())
    }

    pub(crate) fn push_hook(&self, hook: Hook) {
        self.hooks.borrow_mut().push(hook);
    }

    /// Hooks in registration order: module order first, within-module
    /// registration order second (defs run sequentially in module order).
    pub(crate) fn take_hooks(&self) -> Vec<Hook> {
        std::mem::take(&mut self.hooks.borrow_mut())
    }

    pub(crate) fn request_module_loader(&self, resolve: ResolveFn, fetch: FetchFn) {
        *self.loader_request.borrow_mut() = Some((resolve, fetch));
    }

    pub(crate) fn take_loader_request(&self) -> Option<(ResolveFn, FetchFn)> {
        self.loader_request.borrow_mut().take()
    }

    /// Park a host object and return the integer key sandbox methods store
    /// on their receiver. Breaking the object→function→object cycle this
    /// way keeps the guest graph acyclic.
    pub(crate) fn register_receiver(&self, value: Box<dyn Any>) -> u32 {
        let mut receivers = self.receivers.borrow_mut();
        for (i, slot) in receivers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                return i as u32;
            }
        }
        let id = u32::try_from(receivers.len()).expect("receiver registry overflow");
        receivers.push(Some(value));
        id
    }

    /// Run `f` against the parked receiver. The entry is taken out for the
    /// duration of the call, so nested access to a *different* receiver is
    /// fine while re-entrant access to the same one fails.
    pub(crate) fn with_receiver<T: 'static, R>(
        &self,
        id: u32,
        f: impl FnOnce(&mut T) -> R,
    ) -> anyhow::Result<R> {
        let mut taken = self
            .receivers
            .borrow_mut()
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or_else(|| anyhow!("unknown receiver {id}"))?;
        let result = taken
            .downcast_mut::<T>()
            .map(|inner| f(inner))
            .ok_or_else(|| anyhow!("receiver {id} has a different type"));
        if let Some(slot) = self.receivers.borrow_mut().get_mut(id as usize) {
            *slot = Some(taken);
        }
        result
    }

    pub(crate) fn remove_receiver(&self, id: u32) {
        if let Some(slot) = self.receivers.borrow_mut().get_mut(id as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EvalState;
    use crate::vm::HandleTable;

    #[test]
    fn receiver_registry_reuses_slots() {
        let state = EvalState::new(HandleTable::new());
        let a = state.register_receiver(Box::new(1_u32));
        let b = state.register_receiver(Box::new(2_u32));
        assert_ne!(a, b);

        state.remove_receiver(a);
        let c = state.register_receiver(Box::new(3_u32));
        assert_eq!(a, c);

        let got = state
            .with_receiver::<u32, _>(c, |v| *v)
            .expect("receiver");
        assert_eq!(got, 3);
    }

    #[test]
    fn receiver_type_mismatch_is_an_error() {
        let state = EvalState::new(HandleTable::new());
        let id = state.register_receiver(Box::new("text".to_string()));
        assert!(state.with_receiver::<u32, _>(id, |_| ()).is_err());
        // The entry survives a failed access.
        assert!(state
            .with_receiver::<String, _>(id, |s| s.clone())
            .is_ok());
    }
}
