//! The module authoring contract.
//!
//! A [`CageModule`] installs guest-visible bindings for one evaluation. Its
//! `def` runs synchronously inside a context section before the script
//! evaluates; anything asynchronous the module starts later must be
//! registered through [`ModuleContext::keep_alive`] (or the promise bridge)
//! so the evaluation waits for it.

use std::future::Future;
use std::rc::Rc;

use anyhow::anyhow;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};

use crate::marshal::{self, HostFuture};
use crate::state::{Completion, EvalState};
use crate::value::HostValue;
use crate::vm::{self, Saved};

/// A registration routine that installs guest-visible bindings.
///
/// Modules are reusable across evaluations: `def` is invoked once per
/// `run_code`, in caller-supplied order, and must not perform I/O beyond
/// the guest-visible installs.
pub trait CageModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()>;
}

/// Build a module from a plain registration function.
pub fn module_from_fn<F>(f: F) -> FnModule<F>
where
    F: Fn(&mut ModuleContext<'_, '_>) -> anyhow::Result<()>,
{
    FnModule(f)
}

pub struct FnModule<F>(F);

impl<F> CageModule for FnModule<F>
where
    F: Fn(&mut ModuleContext<'_, '_>) -> anyhow::Result<()>,
{
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        (self.0)(mcx)
    }
}

/// What a host-typed sandbox function hands back to the guest.
pub enum SandboxOutput {
    Value(HostValue),
    /// Bridged to a guest promise; the evaluation waits for it.
    Future(HostFuture),
}

impl SandboxOutput {
    pub fn future(
        fut: impl Future<Output = Result<HostValue, HostValue>> + 'static,
    ) -> Self {
        Self::Future(Box::pin(fut))
    }
}

impl From<HostValue> for SandboxOutput {
    fn from(value: HostValue) -> Self {
        Self::Value(value)
    }
}

/// A tree of guest bindings whose leaves are already-built guest values or
/// host values; mappings recurse.
pub enum Shape<'js> {
    Leaf(Value<'js>),
    Host(HostValue),
    Tree(Vec<(String, Shape<'js>)>),
}

impl<'js> Shape<'js> {
    pub fn tree(entries: impl IntoIterator<Item = (impl Into<String>, Shape<'js>)>) -> Self {
        Self::Tree(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Per-evaluation, per-module registration surface.
pub struct ModuleContext<'a, 'js> {
    ctx: &'a Ctx<'js>,
    state: &'a Rc<EvalState>,
    index: usize,
}

impl<'a, 'js> ModuleContext<'a, 'js> {
    pub(crate) fn new(ctx: &'a Ctx<'js>, state: &'a Rc<EvalState>, index: usize) -> Self {
        Self { ctx, state, index }
    }

    #[must_use]
    pub fn ctx(&self) -> &Ctx<'js> {
        self.ctx
    }

    #[must_use]
    pub(crate) fn shared(&self) -> &Rc<EvalState> {
        self.state
    }

    /// Root a guest value for use beyond this context section.
    pub fn save(&self, value: Value<'js>) -> Saved {
        self.state.table.save(self.ctx, value)
    }

    /// Evaluate installation glue (script mode). Registration-time only.
    pub fn eval_glue(&self, source: &str) -> anyhow::Result<()> {
        self.ctx.eval::<(), _>(source).map_err(|err| {
            let guest = vm::guest_error_from_caught(self.ctx, &err);
            anyhow!("glue evaluation failed: {guest}")
        })
    }

    /// Install a value on the guest global object.
    pub fn set_global(&self, name: &str, value: Value<'js>) -> anyhow::Result<()> {
        self.ctx
            .globals()
            .set(name, value)
            .map_err(|err| anyhow!("failed to install global {name}: {err}"))
    }

    /// Build a guest function whose callback works on guest values directly.
    /// The returned handle is owned by the evaluation.
    pub fn fn_raw<F>(&self, name: &str, f: F) -> anyhow::Result<Function<'js>>
    where
        F: for<'b> Fn(Ctx<'b>, Rest<Value<'b>>) -> rquickjs::Result<Value<'b>> + 'static,
    {
        let function = Function::new(self.ctx.clone(), f)
            .map_err(|err| anyhow!("failed to build function {name}: {err}"))?;
        function
            .set_name(name)
            .map_err(|err| anyhow!("failed to name function {name}: {err}"))?;
        Ok(function)
    }

    /// Install a raw sandbox function on the guest global object.
    pub fn define_fn_raw<F>(&self, name: &str, f: F) -> anyhow::Result<()>
    where
        F: for<'b> Fn(Ctx<'b>, Rest<Value<'b>>) -> rquickjs::Result<Value<'b>> + 'static,
    {
        let function = self.fn_raw(name, f)?;
        self.set_global(name, function.into_value())
    }

    /// Build a guest method: the callback receives the call receiver
    /// (`this`) alongside the arguments. Pair with [`receiver_key`] to
    /// recover host state parked via [`ModuleContext::register_receiver`].
    pub fn fn_method<F>(&self, name: &str, f: F) -> anyhow::Result<Function<'js>>
    where
        F: for<'b> Fn(Ctx<'b>, Object<'b>, Rest<Value<'b>>) -> rquickjs::Result<Value<'b>>
            + 'static,
    {
        let function = Function::new(
            self.ctx.clone(),
            move |ctx: Ctx<'js>, this: rquickjs::function::This<Object<'js>>, args: Rest<Value<'js>>| {
                f(ctx, this.0, args)
            },
        )
        .map_err(|err| anyhow!("failed to build method {name}: {err}"))?;
        function
            .set_name(name)
            .map_err(|err| anyhow!("failed to name method {name}: {err}"))?;
        Ok(function)
    }

    /// Build a host-typed sandbox function: arguments are dumped, the result
    /// is marshalled (futures become guest promises), and errors surface as
    /// guest exceptions carrying `{name, message}`. A host failure never
    /// crosses the boundary uncaught.
    pub fn fn_host<F>(&self, name: &str, f: F) -> anyhow::Result<Function<'js>>
    where
        F: Fn(&[HostValue]) -> anyhow::Result<SandboxOutput> + 'static,
    {
        let state = Rc::clone(self.state);
        self.fn_raw(name, move |ctx, args: Rest<Value<'_>>| {
            let host_args: Vec<HostValue> = args.iter().map(vm::dump).collect();
            match f(&host_args) {
                Ok(SandboxOutput::Value(value)) => marshal::to_guest(&ctx, &value)
                    .map_err(|err| vm::throw_error(&ctx, "TypeError", &err.to_string())),
                Ok(SandboxOutput::Future(future)) => {
                    marshal::promise_to_guest(&ctx, &state, future)
                        .map_err(|err| vm::throw_error(&ctx, "TypeError", &err.to_string()))
                }
                Err(err) => Err(vm::throw_error(&ctx, "Error", &err.to_string())),
            }
        })
    }

    /// Install a host-typed sandbox function on the guest global object.
    pub fn define_fn<F>(&self, name: &str, f: F) -> anyhow::Result<()>
    where
        F: Fn(&[HostValue]) -> anyhow::Result<SandboxOutput> + 'static,
    {
        let function = self.fn_host(name, f)?;
        self.set_global(name, function.into_value())
    }

    /// Build a nested guest object from a shape tree and install it.
    pub fn define_object(&self, name: &str, shape: Shape<'js>) -> anyhow::Result<()> {
        let value = self.build_shape(shape)?;
        self.set_global(name, value)
    }

    fn build_shape(&self, shape: Shape<'js>) -> anyhow::Result<Value<'js>> {
        match shape {
            Shape::Leaf(value) => Ok(value),
            Shape::Host(value) => marshal::to_guest(self.ctx, &value)
                .map_err(|err| anyhow!("failed to marshal shape leaf: {err}")),
            Shape::Tree(entries) => {
                let obj = Object::new(self.ctx.clone())
                    .map_err(|err| anyhow!("failed to build object: {err}"))?;
                for (key, child) in entries {
                    let value = self.build_shape(child)?;
                    obj.set(key.as_str(), value)
                        .map_err(|err| anyhow!("failed to set {key}: {err}"))?;
                }
                Ok(obj.into_value())
            }
        }
    }

    /// Queue a hook to run after the script evaluated and the first job
    /// drain succeeded. Hooks run in module order, then registration order.
    pub fn after_script<F>(&self, hook: F)
    where
        F: for<'b> FnOnce(&Ctx<'b>) -> anyhow::Result<()> + 'static,
    {
        tracing::trace!(module = self.index, "registered after-script hook");
        self.state.push_hook(Box::new(hook));
    }

    /// Register a keep-alive: the evaluation does not complete until the
    /// future settles. Modules doing async host work must gate on this.
    pub fn keep_alive(&self, op: impl Future<Output = ()> + 'static) {
        self.state.push_op(async move {
            op.await;
            Completion::Retired
        });
    }

    /// Install the ESM loader hook: `resolve` maps (importer, request) to a
    /// specifier synchronously; `fetch` produces module text on the host
    /// reactor. Installation happens after all `def`s return.
    pub fn set_module_loader(
        &self,
        resolve: impl Fn(&str, &str) -> anyhow::Result<String> + 'static,
        fetch: impl Fn(String) -> futures::future::LocalBoxFuture<'static, anyhow::Result<String>>
            + 'static,
    ) {
        self.state
            .request_module_loader(Box::new(resolve), Box::new(fetch));
    }

    /// Park a host object and get the integer key to store on a guest
    /// receiver (see [`receiver_key`] and [`with_receiver`]).
    pub fn register_receiver<T: 'static>(&self, value: T) -> u32 {
        self.state.register_receiver(Box::new(value))
    }

    /// Drop a parked receiver before the evaluation ends.
    pub fn remove_receiver(&self, id: u32) {
        self.state.remove_receiver(id);
    }
}

/// Property name under which sandbox objects carry their receiver key.
pub const RECEIVER_KEY: &str = "__cageHostId";

/// Read the receiver key stored on a guest object.
pub fn receiver_key(this: &Object<'_>) -> rquickjs::Result<u32> {
    this.get::<_, Option<u32>>(RECEIVER_KEY)?.ok_or_else(|| {
        rquickjs::Error::new_from_js_message("receiver", "key", "missing host receiver key")
    })
}

/// Recover the host object behind a receiver key.
pub(crate) fn with_receiver<T: 'static, R>(
    state: &Rc<EvalState>,
    id: u32,
    f: impl FnOnce(&mut T) -> R,
) -> anyhow::Result<R> {
    state.with_receiver(id, f)
}
