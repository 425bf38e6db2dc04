//! The cage runtime: one evaluation, end to end.
//!
//! `run_code` owns the pipeline: bring up the engine, install modules,
//! evaluate the script as an ES module (fetching imports between
//! declaration attempts when a loader is installed), drain the guest job
//! queue, run after-script hooks, pump host operations to completion while
//! re-draining jobs, then tear everything down through the scope. Every
//! failure path reports through the returned [`EvalResult`].

use std::rc::Rc;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{CageError, EvalResult, GuestError};
use crate::marshal;
use crate::module::{CageModule, ModuleContext};
use crate::scope::Scope;
use crate::state::{Completion, EvalState, PendingOp};
use crate::vm::{PromiseState, Saved, Vm, VmConfig};

/// Import-graph fetch rounds before giving up; each round fetches every
/// specifier the previous declaration attempt missed.
const MAX_IMPORT_ROUNDS: usize = 64;

const ENTRY_FILENAME: &str = "input";

#[derive(Clone, Debug, Default)]
pub struct CageBuilder {
    config: VmConfig,
}

impl CageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Guest stack limit in bytes.
    #[must_use]
    pub const fn max_stack_size(mut self, bytes: usize) -> Self {
        self.config.max_stack_size = bytes;
        self
    }

    /// Guest heap limit in bytes.
    #[must_use]
    pub const fn memory_limit(mut self, bytes: usize) -> Self {
        self.config.memory_limit = Some(bytes);
        self
    }

    #[must_use]
    pub fn build(self) -> Cage {
        Cage {
            config: self.config,
        }
    }
}

/// An embeddable sandbox. Holds only configuration; every evaluation gets a
/// fresh runtime and context, so cages share no mutable state.
pub struct Cage {
    config: VmConfig,
}

impl Cage {
    #[must_use]
    pub fn builder() -> CageBuilder {
        CageBuilder::new()
    }

    #[must_use]
    pub fn new() -> Self {
        CageBuilder::new().build()
    }

    /// Evaluate `source` with the supplied modules installed.
    ///
    /// The returned future is `!Send`; drive it on the thread that owns the
    /// cage (current-thread runtime or `block_on`). Dropping it cancels the
    /// evaluation and still tears the engine down.
    pub async fn run_code(&self, source: &str, modules: &[&dyn CageModule]) -> EvalResult {
        let scope = Scope::new();
        // The guard covers cancellation; on the normal path the explicit
        // close below wins and the guard's close is a no-op.
        let _guard = scope.guard();
        let result = self.run_inner(source, modules, &scope).await;
        let disposal = scope.close();
        match (result, disposal) {
            (Err(err), _) => {
                tracing::debug!(error = %err, "evaluation failed");
                Err(err)
            }
            (Ok(()), Err(err)) => Err(CageError::Engine(err)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn run_inner(
        &self,
        source: &str,
        modules: &[&dyn CageModule],
        scope: &Scope,
    ) -> EvalResult {
        let vm = Rc::new(Vm::new(&self.config)?);
        {
            let vm = Rc::clone(&vm);
            scope
                .defer(move || {
                    vm.clear_handles();
                    Ok(())
                })
                .map_err(|err| CageError::Engine(err.into()))?;
        }
        let state = Rc::new(EvalState::new(vm.table().clone()));
        {
            // Uncollected operations can hold the state alive through their
            // captures; dropping them at teardown breaks the cycle.
            let state = Rc::clone(&state);
            scope
                .defer(move || {
                    drop(state.take_ops());
                    Ok(())
                })
                .map_err(|err| CageError::Engine(err.into()))?;
        }

        // Modules install in caller-supplied order; a throwing def aborts
        // the evaluation before any script runs.
        vm.with(|ctx| -> EvalResult {
            for (index, module) in modules.iter().enumerate() {
                let mut mcx = ModuleContext::new(ctx, &state, index);
                module
                    .def(&mut mcx)
                    .map_err(CageError::ModuleRegistration)?;
            }
            Ok(())
        })?;
        if let Some((resolve, fetch)) = state.take_loader_request() {
            vm.set_module_loader(resolve, fetch);
        }

        let evaluated = self.evaluate_entry(&vm, source).await?;
        let evaluated = scope
            .manage(evaluated)
            .map_err(|err| CageError::Engine(err.into()))?;

        vm.execute_pending_jobs().map_err(CageError::JobQueue)?;

        // Module evaluation reports runtime failures through its completion
        // promise; surface them now so hooks only run on a successful
        // initial eval and drain.
        if let PromiseState::Rejected(err) = vm.promise_state(&evaluated)? {
            return Err(CageError::Guest(err));
        }

        let hooks = state.take_hooks();
        if !hooks.is_empty() {
            tracing::debug!(count = hooks.len(), "running after-script hooks");
            vm.with(|ctx| -> EvalResult {
                for hook in hooks {
                    hook(ctx).map_err(CageError::Hook)?;
                }
                Ok(())
            })?;
        }

        self.pump(&vm, &state).await?;

        // A rejected entry promise (top-level await) is a guest failure; a
        // still-pending one can no longer settle once the queue is quiescent
        // and every host operation retired.
        match vm.promise_state(&evaluated)? {
            PromiseState::Rejected(err) => Err(CageError::Guest(err)),
            PromiseState::Pending | PromiseState::Fulfilled => Ok(()),
        }
    }

    /// Evaluate the entry script in module mode, fetching missing imports
    /// between declaration attempts. Declaration never runs user code, so
    /// retrying after a fetch round is side-effect free.
    async fn evaluate_entry(&self, vm: &Vm, source: &str) -> Result<Saved, CageError> {
        let mut rounds = 0;
        loop {
            match vm.eval_module(source, ENTRY_FILENAME) {
                Ok(promise) => return Ok(promise),
                Err(guest_err) => {
                    let missing = vm.take_missing_modules();
                    if missing.is_empty() {
                        return Err(CageError::Guest(guest_err));
                    }
                    rounds += 1;
                    if rounds > MAX_IMPORT_ROUNDS {
                        return Err(CageError::Guest(GuestError::new(
                            "Error",
                            "import graph exceeded the fetch budget",
                        )));
                    }
                    for specifier in missing {
                        tracing::debug!(%specifier, "fetching imported module");
                        vm.fetch_module(&specifier).await.map_err(|err| {
                            CageError::Guest(GuestError::new(
                                "TypeError",
                                format!("failed to load module {specifier}: {err}"),
                            ))
                        })?;
                    }
                }
            }
        }
    }

    /// Interleave guest job drains with host-operation completions until no
    /// operation remains, then drain once more. The await on the next
    /// completion is the cooperative yield to the host reactor; completed
    /// host work becomes visible to the guest no earlier than the next
    /// iteration.
    async fn pump(&self, vm: &Vm, state: &Rc<EvalState>) -> EvalResult {
        let mut pending: FuturesUnordered<PendingOp> = FuturesUnordered::new();
        loop {
            for op in state.take_ops() {
                pending.push(op);
            }
            vm.execute_pending_jobs().map_err(CageError::JobQueue)?;
            // The drain itself may have scheduled host work (a microtask
            // arming a timer); collect again before deciding to stop, so the
            // last iteration's drain doubles as the final drain.
            for op in state.take_ops() {
                pending.push(op);
            }
            if pending.is_empty() {
                break;
            }
            tracing::trace!(pending = pending.len(), "awaiting host operations");
            let Some(completion) = pending.next().await else {
                break;
            };
            Self::deliver(vm, completion)?;
        }
        Ok(())
    }

    fn deliver(vm: &Vm, completion: Completion) -> EvalResult {
        match completion {
            Completion::Retired => Ok(()),
            Completion::Run(callback) => vm.with(|ctx| callback(ctx)),
            Completion::Settle {
                resolve,
                reject,
                outcome,
            } => vm.with(|ctx| marshal::settle(ctx, &resolve, &reject, &outcome)),
        }
    }
}

impl Default for Cage {
    fn default() -> Self {
        Self::new()
    }
}
