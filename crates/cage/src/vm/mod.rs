//! Engine adapter: a thin, typed facade over the embedded QuickJS
//! interpreter.
//!
//! The adapter hides binding mechanics behind a small operation set:
//! runtime/context creation, module-mode evaluation with in-band error
//! capture, pending-job draining, the module-loader hook, host-held roots
//! ([`Saved`]) and structural dumping. The runtime above composes these;
//! nothing here schedules host work.
//!
//! One engine constraint shapes the API: the runtime lock is held for the
//! whole of a context section, so runtime-level operations (job draining,
//! loader installation) must never be invoked from inside [`Vm::with`].

mod dump;
mod handle;
mod loader;

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use rquickjs::{Context, Ctx, Function, Object, Runtime, Value};

use crate::error::{CageError, GuestError};

pub use dump::dump;
pub(crate) use dump::MAX_DEPTH;
pub use handle::{HandleTable, Saved};
pub(crate) use loader::{FetchFn, ResolveFn};
use loader::{CageLoader, CageResolver, LoaderShared};

#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Guest stack limit in bytes.
    pub max_stack_size: usize,
    /// Guest heap limit in bytes; `None` leaves the engine default.
    pub memory_limit: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack_size: 2 * 1024 * 1024,
            memory_limit: None,
        }
    }
}

/// Outcome of checking a saved promise without driving it.
pub(crate) enum PromiseState {
    Pending,
    Fulfilled,
    Rejected(GuestError),
}

pub struct Vm {
    // Runtime must outlive the context; field order is the drop order.
    context: Context,
    runtime: Runtime,
    table: HandleTable,
    loader: RefCell<Option<Rc<RefCell<LoaderShared>>>>,
    fetcher: RefCell<Option<FetchFn>>,
}

impl Vm {
    /// Create a fresh runtime and context with the configured limits.
    ///
    /// # Errors
    /// Returns [`CageError::Engine`] if the engine cannot be brought up.
    pub fn new(config: &VmConfig) -> Result<Self, CageError> {
        let runtime = Runtime::new()
            .map_err(|err| CageError::Engine(anyhow!("failed to create runtime: {err}")))?;
        runtime.set_max_stack_size(config.max_stack_size);
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        let context = Context::full(&runtime)
            .map_err(|err| CageError::Engine(anyhow!("failed to create context: {err}")))?;
        Ok(Self {
            context,
            runtime,
            table: HandleTable::new(),
            loader: RefCell::new(None),
            fetcher: RefCell::new(None),
        })
    }

    /// Run a context section. Nothing guest-scoped may escape the closure.
    pub fn with<R>(&self, f: impl for<'js> FnOnce(&Ctx<'js>) -> R) -> R {
        self.context.with(|ctx| f(&ctx))
    }

    #[must_use]
    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    /// Root a guest value in the evaluation's handle table.
    pub fn save<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> Saved {
        self.table.save(ctx, value)
    }

    /// Install the module loader hook: a synchronous specifier resolver and
    /// an asynchronous text fetcher. Must be called outside [`Vm::with`].
    pub fn set_module_loader(&self, resolve: ResolveFn, fetch: FetchFn) {
        let shared = Rc::new(RefCell::new(LoaderShared::default()));
        self.runtime.set_loader(
            CageResolver { resolve },
            CageLoader {
                shared: Rc::clone(&shared),
            },
        );
        *self.loader.borrow_mut() = Some(shared);
        *self.fetcher.borrow_mut() = Some(fetch);
    }

    /// Specifiers the loader failed to serve during the last declaration
    /// attempt. Empty when no loader is installed.
    #[must_use]
    pub fn take_missing_modules(&self) -> Vec<String> {
        self.loader
            .borrow()
            .as_ref()
            .map_or_else(Vec::new, |shared| shared.borrow_mut().take_missing())
    }

    /// Fetch one module text through the installed fetcher and cache it for
    /// the next declaration attempt.
    ///
    /// # Errors
    /// Fails when no loader is installed or the fetcher reports an error.
    pub async fn fetch_module(&self, specifier: &str) -> anyhow::Result<()> {
        let fut = {
            let fetcher = self.fetcher.borrow();
            let fetcher = fetcher
                .as_ref()
                .ok_or_else(|| anyhow!("no module fetcher installed"))?;
            fetcher(specifier.to_string())
        };
        let text = fut.await?;
        let loader = self.loader.borrow();
        let shared = loader
            .as_ref()
            .ok_or_else(|| anyhow!("no module loader installed"))?;
        shared.borrow_mut().insert(specifier.to_string(), text);
        Ok(())
    }

    /// Evaluate source in module mode. Errors are returned in-band as dumped
    /// guest errors; on success the module's completion promise is rooted
    /// and returned for a later state check.
    pub fn eval_module(&self, source: &str, filename: &str) -> Result<Saved, GuestError> {
        self.with(|ctx| {
            match rquickjs::Module::evaluate(ctx.clone(), filename, source) {
                Ok(promise) => Ok(self.table.save(ctx, promise.into_value())),
                Err(err) => Err(guest_error_from_caught(ctx, &err)),
            }
        })
    }

    /// Drain the guest job queue to quiescence. Returns the number of jobs
    /// executed or the first job that threw.
    pub fn execute_pending_jobs(&self) -> Result<usize, GuestError> {
        let mut executed = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(err) => {
                    return Err(GuestError::new("Error", format!("pending job failed: {err}")));
                }
            }
        }
        if executed > 0 {
            tracing::trace!(executed, "drained guest jobs");
        }
        Ok(executed)
    }

    /// Check a rooted promise without driving it.
    pub(crate) fn promise_state(&self, saved: &Saved) -> Result<PromiseState, CageError> {
        self.with(|ctx| {
            let value = saved
                .restore(ctx)
                .map_err(|err| CageError::Engine(anyhow!("promise handle lost: {err}")))?;
            let Some(promise) = value.as_promise() else {
                return Ok(PromiseState::Fulfilled);
            };
            match promise.result::<Value<'_>>() {
                None => Ok(PromiseState::Pending),
                Some(Ok(_)) => Ok(PromiseState::Fulfilled),
                Some(Err(_)) => Ok(PromiseState::Rejected(catch_guest_error(ctx))),
            }
        })
    }

    /// Drop every rooted handle. Runs during scope teardown, while the
    /// runtime is still alive.
    pub fn clear_handles(&self) {
        self.table.clear();
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Roots must not outlive the runtime they point into.
        self.table.clear();
    }
}

/// Call a guest function; a thrown exception comes back as a dumped guest
/// error instead of an engine error.
pub fn call_function<'js>(
    ctx: &Ctx<'js>,
    function: &Function<'js>,
    args: rquickjs::function::Args<'js>,
) -> Result<Value<'js>, GuestError> {
    function
        .call_arg(args)
        .map_err(|err| guest_error_from_caught(ctx, &err))
}

/// `typeof` classification used by the dumping and marshalling layers.
#[must_use]
pub fn type_of(value: &Value<'_>) -> &'static str {
    if value.is_undefined() {
        "undefined"
    } else if value.is_null() {
        "null"
    } else if value.is_bool() {
        "boolean"
    } else if value.is_number() {
        "number"
    } else if value.is_string() {
        "string"
    } else if value.is_function() {
        "function"
    } else {
        "object"
    }
}

/// Build a real guest `Error` instance so `instanceof Error` holds.
pub fn new_error<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    message: &str,
) -> rquickjs::Result<Value<'js>> {
    let ctor: rquickjs::function::Constructor<'_> = ctx.globals().get("Error")?;
    let err: Object<'_> = ctor.construct((message,))?;
    if name != "Error" {
        err.set("name", name)?;
    }
    Ok(err.into_value())
}

/// Throw a guest error with the given name and message from host code.
pub fn throw_error(ctx: &Ctx<'_>, name: &str, message: &str) -> rquickjs::Error {
    match new_error(ctx, name, message) {
        Ok(value) => ctx.throw(value),
        Err(err) => err,
    }
}

/// Capture whatever exception is pending on the context.
pub(crate) fn catch_guest_error(ctx: &Ctx<'_>) -> GuestError {
    let caught = ctx.catch();
    guest_error_from_value(&caught)
}

/// Capture the failure of an engine operation: prefer the pending guest
/// exception, fall back to the engine error text.
pub(crate) fn guest_error_from_caught(ctx: &Ctx<'_>, err: &rquickjs::Error) -> GuestError {
    let caught = ctx.catch();
    if caught.is_undefined() {
        GuestError::new("Error", err.to_string())
    } else {
        guest_error_from_value(&caught)
    }
}

fn guest_error_from_value(value: &Value<'_>) -> GuestError {
    if let Some(exc) = value.as_exception() {
        let name = exc
            .get::<_, Option<String>>("name")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Error".to_string());
        let message = exc
            .get::<_, Option<String>>("message")
            .ok()
            .flatten()
            .or_else(|| exc.message())
            .unwrap_or_default();
        return GuestError {
            name,
            message,
            stack: exc.stack(),
        };
    }
    GuestError::new("Error", dump(value).to_display_string())
}

#[cfg(test)]
mod tests {
    use super::{dump, type_of, Vm, VmConfig};
    use crate::value::HostValue;

    fn vm() -> Vm {
        Vm::new(&VmConfig::default()).expect("engine")
    }

    #[test]
    fn handles_root_values_across_sections() {
        let vm = vm();
        let saved = vm.with(|ctx| {
            let value: rquickjs::Value<'_> = ctx.eval("({a: 1})").expect("eval");
            vm.save(ctx, value)
        });
        assert!(saved.alive());
        let dumped = vm.with(|ctx| dump(&saved.restore(ctx).expect("restore")));
        assert_eq!(
            dumped,
            HostValue::object([("a", HostValue::Number(1.0))])
        );
    }

    #[test]
    fn dup_yields_an_independent_owner() {
        let vm = vm();
        let saved = vm.with(|ctx| {
            let value: rquickjs::Value<'_> = ctx.eval("42").expect("eval");
            vm.save(ctx, value)
        });
        let dup = saved.dup().expect("dup");
        saved.dispose();
        assert!(!saved.alive());
        assert!(dup.alive());
        let dumped = vm.with(|ctx| dump(&dup.restore(ctx).expect("restore")));
        assert_eq!(dumped, HostValue::Number(42.0));
    }

    #[test]
    fn release_is_idempotent_and_restore_fails_after_dispose() {
        let vm = vm();
        let saved = vm.with(|ctx| {
            let value: rquickjs::Value<'_> = ctx.eval("\"x\"").expect("eval");
            vm.save(ctx, value)
        });
        saved.release();
        saved.release();
        assert!(!saved.alive());
        assert!(vm.with(|ctx| saved.restore(ctx).is_err()));
        assert_eq!(vm.table().live(), 0);
    }

    #[test]
    fn clear_handles_empties_the_table() {
        let vm = vm();
        for _ in 0..3 {
            vm.with(|ctx| {
                let value: rquickjs::Value<'_> = ctx.eval("1").expect("eval");
                let _ = vm.save(ctx, value);
            });
        }
        assert_eq!(vm.table().live(), 3);
        vm.clear_handles();
        assert_eq!(vm.table().live(), 0);
    }

    #[test]
    fn dump_covers_the_value_taxonomy() {
        let vm = vm();
        vm.with(|ctx| {
            let value: rquickjs::Value<'_> = ctx
                .eval("({n: 1.5, s: \"hi\", b: true, v: null, arr: [1, 2], f: () => {}})")
                .expect("eval");
            let dumped = dump(&value);
            assert_eq!(dumped.get("n"), Some(&HostValue::Number(1.5)));
            assert_eq!(dumped.get("s"), Some(&HostValue::String("hi".into())));
            assert_eq!(dumped.get("b"), Some(&HostValue::Bool(true)));
            assert_eq!(dumped.get("v"), Some(&HostValue::Null));
            assert_eq!(
                dumped.get("arr"),
                Some(&HostValue::Array(vec![
                    HostValue::Number(1.0),
                    HostValue::Number(2.0)
                ]))
            );
            assert_eq!(dumped.get("f"), Some(&HostValue::Opaque));
        });
    }

    #[test]
    fn dump_preserves_error_shape() {
        let vm = vm();
        vm.with(|ctx| {
            let value: rquickjs::Value<'_> =
                ctx.eval("new TypeError(\"bad\")").expect("eval");
            assert_eq!(
                dump(&value),
                HostValue::error("TypeError", "bad")
            );
        });
    }

    #[test]
    fn typeof_matches_the_contract() {
        let vm = vm();
        vm.with(|ctx| {
            let cases: &[(&str, &str)] = &[
                ("undefined", "undefined"),
                ("null", "null"),
                ("true", "boolean"),
                ("1.25", "number"),
                ("\"s\"", "string"),
                ("(() => {})", "function"),
                ("({})", "object"),
            ];
            for (source, expected) in cases {
                let value: rquickjs::Value<'_> = ctx.eval(*source).expect("eval");
                assert_eq!(type_of(&value), *expected, "typeof {source}");
            }
        });
    }

    #[test]
    fn eval_module_reports_syntax_errors_in_band() {
        let vm = vm();
        let err = vm
            .eval_module("const a=1; const b=;", "input")
            .expect_err("syntax error");
        assert_eq!(err.name, "SyntaxError");
        assert!(!err.message.is_empty());
    }
}
