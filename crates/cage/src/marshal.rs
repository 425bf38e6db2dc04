//! Host→guest value conversion and the promise bridge.

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use rquickjs::{Array, ArrayBuffer, Ctx, Function, Object, Promise, Value};

use crate::error::{CageError, MarshalError};
use crate::state::{Completion, EvalState};
use crate::value::HostValue;
use crate::vm::{self, Saved};

/// Host future bridged to a guest promise: `Ok` fulfills, `Err` rejects.
pub type HostFuture = LocalBoxFuture<'static, Result<HostValue, HostValue>>;

/// Convert a host value into a guest value.
///
/// Conversion is ordered: singletons, strings, numbers (integral values in
/// `i32` range become engine ints), byte buffers, arrays set by index,
/// error shapes as real guest `Error` instances, plain objects set by key
/// in entry order. [`HostValue::Opaque`] (the dump of a guest function)
/// has no guest representation and is rejected; functions must be installed
/// deliberately as sandbox functions.
///
/// # Errors
/// [`MarshalError::Unmarshallable`] for opaque values, or
/// [`MarshalError::Engine`] when the engine rejects a constructor call.
pub fn to_guest<'js>(ctx: &Ctx<'js>, value: &HostValue) -> Result<Value<'js>, MarshalError> {
    to_guest_at(ctx, value, vm::MAX_DEPTH)
}

fn to_guest_at<'js>(
    ctx: &Ctx<'js>,
    value: &HostValue,
    depth: usize,
) -> Result<Value<'js>, MarshalError> {
    if depth == 0 {
        return Err(MarshalError::Engine(
            "maximum marshal depth exceeded, possible circular reference".to_string(),
        ));
    }
    match value {
        HostValue::Undefined => Ok(Value::new_undefined(ctx.clone())),
        HostValue::Null => Ok(Value::new_null(ctx.clone())),
        HostValue::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        HostValue::Number(n) => Ok(number_to_guest(ctx, *n)),
        HostValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)
            .map(rquickjs::String::into_value)
            .map_err(engine_rejected),
        HostValue::Bytes(b) => ArrayBuffer::new(ctx.clone(), b.to_vec())
            .map(ArrayBuffer::into_value)
            .map_err(engine_rejected),
        HostValue::Array(items) => {
            let arr = Array::new(ctx.clone()).map_err(engine_rejected)?;
            for (index, item) in items.iter().enumerate() {
                let guest = to_guest_at(ctx, item, depth - 1)?;
                arr.set(index, guest).map_err(engine_rejected)?;
            }
            Ok(arr.into_value())
        }
        HostValue::Error { name, message } => {
            vm::new_error(ctx, name, message).map_err(engine_rejected)
        }
        HostValue::Object(entries) => {
            let obj = Object::new(ctx.clone()).map_err(engine_rejected)?;
            for (key, item) in entries {
                let guest = to_guest_at(ctx, item, depth - 1)?;
                obj.set(key.as_str(), guest).map_err(engine_rejected)?;
            }
            Ok(obj.into_value())
        }
        HostValue::Opaque => Err(MarshalError::Unmarshallable("function")),
    }
}

fn number_to_guest<'js>(ctx: &Ctx<'js>, n: f64) -> Value<'js> {
    if n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX) {
        Value::new_int(ctx.clone(), n as i32)
    } else {
        Value::new_float(ctx.clone(), n)
    }
}

fn engine_rejected(err: rquickjs::Error) -> MarshalError {
    MarshalError::Engine(err.to_string())
}

/// Bridge a host future to a guest promise.
///
/// The promise's resolve/reject functions are parked in the handle table
/// and the future is registered as a pending operation; the pump settles
/// the promise when the future completes and the parked functions are
/// dropped at settlement.
pub(crate) fn promise_to_guest<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<EvalState>,
    future: HostFuture,
) -> Result<Value<'js>, MarshalError> {
    let (promise, resolve, reject) = Promise::new(ctx).map_err(engine_rejected)?;
    let resolve = state.table.save(ctx, resolve.into_value());
    let reject = state.table.save(ctx, reject.into_value());
    state.push_op(async move {
        let outcome = future.await;
        Completion::Settle {
            resolve,
            reject,
            outcome,
        }
    });
    Ok(promise.into_value())
}

/// Deliver a settled host outcome into the guest promise, then drop the
/// parked resolvers so the bridge's closure cycle dies with the settlement.
pub(crate) fn settle(
    ctx: &Ctx<'_>,
    resolve: &Saved,
    reject: &Saved,
    outcome: &Result<HostValue, HostValue>,
) -> Result<(), CageError> {
    let result = settle_inner(ctx, resolve, reject, outcome);
    resolve.release();
    reject.release();
    result
}

fn settle_inner(
    ctx: &Ctx<'_>,
    resolve: &Saved,
    reject: &Saved,
    outcome: &Result<HostValue, HostValue>,
) -> Result<(), CageError> {
    let (target, payload) = match outcome {
        Ok(value) => (resolve, value),
        Err(error) => (reject, error),
    };
    // A payload the marshaller refuses is delivered as a rejection; the
    // guest asked for this value, so the failure belongs to it.
    let (target, guest_value) = match to_guest(ctx, payload) {
        Ok(value) => (target, value),
        Err(err) => {
            let error = vm::new_error(ctx, "TypeError", &err.to_string())
                .map_err(|e| CageError::Engine(anyhow::anyhow!("error construction failed: {e}")))?;
            (reject, error)
        }
    };
    let function: Option<Function<'_>> = target
        .restore(ctx)
        .ok()
        .and_then(|v| v.as_function().cloned());
    let function = function
        .ok_or_else(|| CageError::Engine(anyhow::anyhow!("promise resolver handle lost")))?;
    function
        .call::<_, ()>((guest_value,))
        .map_err(|err| CageError::Guest(vm::guest_error_from_caught(ctx, &err)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::to_guest;
    use crate::error::MarshalError;
    use crate::value::HostValue;
    use crate::vm::{dump, Vm, VmConfig};

    fn vm() -> Vm {
        Vm::new(&VmConfig::default()).expect("engine")
    }

    #[test]
    fn round_trip_is_structural_identity() {
        let vm = vm();
        let value = HostValue::object([
            ("n", HostValue::Number(1.0)),
            ("half", HostValue::Number(0.5)),
            ("s", HostValue::from("text")),
            ("flag", HostValue::Bool(true)),
            ("missing", HostValue::Null),
            (
                "items",
                HostValue::Array(vec![HostValue::from("a"), HostValue::Number(2.0)]),
            ),
        ]);
        let dumped = vm.with(|ctx| {
            let guest = to_guest(ctx, &value).expect("marshal");
            dump(&guest)
        });
        assert_eq!(dumped, value);
    }

    #[test]
    fn error_shape_marshals_to_a_real_error() {
        let vm = vm();
        vm.with(|ctx| {
            let guest = to_guest(ctx, &HostValue::error("RangeError", "out of range"))
                .expect("marshal");
            let is_error: bool = ctx
                .globals()
                .get::<_, rquickjs::Function<'_>>("Error")
                .and_then(|ctor| {
                    let check: rquickjs::Function<'_> =
                        ctx.eval("(v, ctor) => v instanceof ctor")?;
                    check.call((guest.clone(), ctor))
                })
                .expect("instanceof check");
            assert!(is_error);
            assert_eq!(dump(&guest), HostValue::error("RangeError", "out of range"));
        });
    }

    #[test]
    fn functions_are_unmarshallable() {
        let vm = vm();
        vm.with(|ctx| {
            let err = to_guest(ctx, &HostValue::Opaque).expect_err("must fail");
            assert!(matches!(err, MarshalError::Unmarshallable("function")));
        });
    }

    #[test]
    fn integral_numbers_become_engine_ints() {
        let vm = vm();
        vm.with(|ctx| {
            let guest = to_guest(ctx, &HostValue::Number(7.0)).expect("marshal");
            assert!(guest.is_int());
            let guest = to_guest(ctx, &HostValue::Number(7.5)).expect("marshal");
            assert!(!guest.is_int());
        });
    }
}
