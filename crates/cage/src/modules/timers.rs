//! Timer capability: `setTimeout` / `setInterval` and their cancellation.
//!
//! Every scheduled timer registers a pending host operation, so the
//! evaluation does not complete while a timeout is outstanding. Clearing a
//! timer drops its cancellation sender, which retires the host operation
//! and releases the parked callback handles; a fire that was already in
//! flight when the timer was cleared is skipped at delivery time.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use rquickjs::function::{Args, Rest};
use rquickjs::{Ctx, Function, Value};
use tokio::sync::oneshot;

use crate::error::CageError;
use crate::module::{CageModule, ModuleContext};
use crate::state::{Completion, EvalState};
use crate::vm::{self, Saved};

pub struct TimersModule;

#[derive(Default)]
struct TimerState {
    next_id: u64,
    /// Live timers by id; removing an entry cancels the timer.
    live: HashMap<u64, oneshot::Sender<()>>,
}

struct TimerHandles {
    id: u64,
    callback: Saved,
    args: Vec<Saved>,
}

impl TimerHandles {
    fn release(&self) {
        self.callback.release();
        for arg in &self.args {
            arg.release();
        }
    }
}

impl CageModule for TimersModule {
    fn def(&self, mcx: &mut ModuleContext<'_, '_>) -> anyhow::Result<()> {
        let timers = Rc::new(RefCell::new(TimerState::default()));

        for (name, repeat) in [("setTimeout", false), ("setInterval", true)] {
            let timers = Rc::clone(&timers);
            let shared = Rc::clone(mcx.shared());
            mcx.define_fn_raw(name, move |ctx, args: Rest<Value<'_>>| {
                schedule(&ctx, &shared, &timers, &args, repeat)
            })?;
        }

        for name in ["clearTimeout", "clearInterval"] {
            let timers = Rc::clone(&timers);
            mcx.define_fn_raw(name, move |ctx, args: Rest<Value<'_>>| {
                if let Some(id) = args.first().and_then(Value::as_number) {
                    timers.borrow_mut().live.remove(&(id as u64));
                }
                Ok(Value::new_undefined(ctx.clone()))
            })?;
        }

        mcx.eval_glue(TIMERS_GLUE)
    }
}

const TIMERS_GLUE: &str = r#"
globalThis.queueMicrotask = (callback) => {
  if (typeof callback !== "function") {
    throw new TypeError("queueMicrotask expects a function");
  }
  Promise.resolve().then(callback);
};
"#;

fn schedule<'js>(
    ctx: &Ctx<'js>,
    shared: &Rc<EvalState>,
    timers: &Rc<RefCell<TimerState>>,
    args: &[Value<'js>],
    repeat: bool,
) -> rquickjs::Result<Value<'js>> {
    let Some(callback) = args.first().filter(|v| v.is_function()) else {
        return Err(vm::throw_error(
            ctx,
            "TypeError",
            "timer callback must be a function",
        ));
    };

    let delay_ms = args
        .get(1)
        .and_then(Value::as_number)
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .unwrap_or(0.0);
    let delay = Duration::from_millis(delay_ms as u64);

    let timer = TimerHandles {
        id: {
            let mut state = timers.borrow_mut();
            state.next_id += 1;
            state.next_id
        },
        callback: shared.table.save(ctx, callback.clone()),
        args: args[2..]
            .iter()
            .map(|arg| shared.table.save(ctx, arg.clone()))
            .collect(),
    };
    let id = timer.id;

    let (cancel_tx, cancel_rx) = oneshot::channel();
    timers.borrow_mut().live.insert(id, cancel_tx);
    arm(shared, timers, timer, delay, repeat, cancel_rx);

    tracing::trace!(id, delay_ms, repeat, "timer scheduled");
    Ok(Value::new_float(ctx.clone(), id as f64))
}

fn arm(
    shared: &Rc<EvalState>,
    timers: &Rc<RefCell<TimerState>>,
    timer: TimerHandles,
    delay: Duration,
    repeat: bool,
    mut cancel: oneshot::Receiver<()>,
) {
    let shared_for_fire = Rc::clone(shared);
    let timers_for_fire = Rc::clone(timers);
    shared.push_op(async move {
        let expired = tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = &mut cancel => false,
        };
        if !expired {
            timer.release();
            return Completion::Retired;
        }
        Completion::Run(Box::new(move |ctx| {
            fire(
                ctx,
                &shared_for_fire,
                &timers_for_fire,
                timer,
                delay,
                repeat,
                cancel,
            )
        }))
    });
}

fn fire(
    ctx: &Ctx<'_>,
    shared: &Rc<EvalState>,
    timers: &Rc<RefCell<TimerState>>,
    timer: TimerHandles,
    delay: Duration,
    repeat: bool,
    cancel: oneshot::Receiver<()>,
) -> Result<(), CageError> {
    // Cleared between expiry and delivery.
    if !timers.borrow().live.contains_key(&timer.id) {
        timer.release();
        return Ok(());
    }

    let function: Option<Function<'_>> = timer
        .callback
        .restore(ctx)
        .ok()
        .and_then(|v| v.as_function().cloned());
    let Some(function) = function else {
        timer.release();
        return Err(CageError::Engine(anyhow::anyhow!(
            "timer callback handle lost"
        )));
    };

    let mut call_args = Args::new(ctx.clone(), timer.args.len());
    for arg in &timer.args {
        let value = arg
            .restore(ctx)
            .map_err(|err| CageError::Engine(anyhow::anyhow!("timer argument lost: {err}")))?;
        call_args
            .push_arg(value)
            .map_err(|err| CageError::Engine(anyhow::anyhow!("timer argument rejected: {err}")))?;
    }

    if let Err(err) = vm::call_function(ctx, &function, call_args) {
        timers.borrow_mut().live.remove(&timer.id);
        timer.release();
        // There is no guest frame above a timer callback to catch this.
        return Err(CageError::Guest(err));
    }

    if repeat && timers.borrow().live.contains_key(&timer.id) {
        arm(shared, timers, timer, delay, true, cancel);
    } else {
        timers.borrow_mut().live.remove(&timer.id);
        timer.release();
    }
    Ok(())
}
