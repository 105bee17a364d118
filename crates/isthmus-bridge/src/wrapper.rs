//! Object wrapper operations and the call proxy.
//!
//! Every function here works on the runtime that owns the wrapped object
//! (the "home" runtime) and speaks [`ForeignValue`] at its edges, so the same
//! code serves calls in both directions.

use std::rc::Rc;

use isthmus_core::{
    Capabilities, ForeignValue, ObjectId, ObjectRetainer, Runtime, RuntimeError, RuntimeResult,
    WrapperHandle, WrapperRef,
};
use tracing::trace;

use crate::cache::{BridgeRef, CountToken};
use crate::convert;
use crate::error::{BridgeError, BridgeResult, CallFailure, HandleFault};
use crate::scope::ScopeCore;

/// Wrapper for `object`, creating and caching it on first use.
///
/// A cache hit returns the existing handle. A miss takes exactly one counted
/// reference on the object, owned by the new cache entry.
/// Refused once the scope is no longer live, so a teardown from inside a
/// foreign call leaves nothing behind in the cleared cache.
pub(crate) fn wrap<R: Runtime>(
    core: &ScopeCore,
    runtime: &Rc<R>,
    object: ObjectId,
) -> RuntimeResult<WrapperRef> {
    if !core.is_live() {
        return Err(RuntimeError::Revoked(core.id()));
    }
    if let Some(handle) = core.cache(R::SIDE).borrow().get(object) {
        return Ok(handle);
    }

    let capabilities = if runtime.is_callable(object) {
        Capabilities::ALL
    } else {
        Capabilities::READ_WRITE
    };
    let retainer: Rc<dyn ObjectRetainer> = runtime.clone();
    let token = CountToken::acquire(retainer, R::SIDE, object)?;
    let handle = Rc::new(WrapperHandle::new(
        core.next_handle(),
        R::SIDE,
        object,
        core.id(),
        capabilities,
        core.liveness().clone(),
    ));
    core.cache(R::SIDE)
        .borrow_mut()
        .insert(handle.clone(), BridgeRef::new(token));

    trace!(
        scope = %core.id(),
        handle = %handle.id(),
        side = %R::SIDE,
        object = %object,
        capabilities = %capabilities,
        "wrapper created"
    );
    Ok(handle)
}

/// Checked downcast from a handle to the object it wraps.
pub(crate) fn unwrap<R: Runtime>(
    core: &ScopeCore,
    handle: &WrapperRef,
    required: Capabilities,
) -> BridgeResult<ObjectId> {
    let fail = |fault| BridgeError::invalid_handle(handle.id(), fault);
    if !handle.is_live() {
        return Err(fail(HandleFault::ScopeTornDown));
    }
    core.cache(R::SIDE)
        .borrow()
        .validate(handle)
        .map_err(fail)?;
    if !handle.capabilities().contains(required) {
        return Err(fail(HandleFault::CapabilityMismatch {
            required,
            actual: handle.capabilities(),
        }));
    }
    Ok(handle.object())
}

/// Read `key` from the wrapped object.
pub(crate) fn get<R: Runtime>(
    core: &ScopeCore,
    home: &Rc<R>,
    handle: &WrapperRef,
    key: &str,
) -> BridgeResult<ForeignValue> {
    let object = unwrap::<R>(core, handle, Capabilities::READ)?;
    let value = home
        .get_property(object, key)
        .map_err(|e| BridgeError::property(key, e))?;
    let converted = convert::import(core, home, &value);
    home.discard(value);
    converted
}

/// Write `key` on the wrapped object.
pub(crate) fn set<R: Runtime>(
    core: &ScopeCore,
    home: &Rc<R>,
    handle: &WrapperRef,
    key: &str,
    value: &ForeignValue,
) -> BridgeResult<()> {
    let object = unwrap::<R>(core, handle, Capabilities::WRITE)?;
    let native = convert::export(core, home, value)?;
    let result = home.set_property(object, key, native.clone());
    home.discard(native);
    result.map_err(|e| BridgeError::property(key, e))
}

/// Own property keys of the wrapped object.
pub(crate) fn keys<R: Runtime>(
    core: &ScopeCore,
    home: &Rc<R>,
    handle: &WrapperRef,
) -> BridgeResult<Vec<String>> {
    let object = unwrap::<R>(core, handle, Capabilities::READ)?;
    home.own_keys(object)
        .map_err(|e| BridgeError::property("<keys>", e))
}

/// Invoke the wrapped callable.
///
/// Arguments are converted in order before anything is invoked; if one fails
/// the call never happens. Nesting is bounded by `max_call_depth`.
pub(crate) fn call<R: Runtime>(
    core: &ScopeCore,
    home: &Rc<R>,
    handle: &WrapperRef,
    args: &[ForeignValue],
) -> BridgeResult<ForeignValue> {
    let object = unwrap::<R>(core, handle, Capabilities::CALL)?;

    let depth = core.call_depth().get();
    let limit = core.config().max_call_depth;
    if depth >= limit {
        return Err(BridgeError::Call(CallFailure::RecursionLimit { limit }));
    }
    core.call_depth().set(depth + 1);
    let _depth = scopeguard::guard(core.call_depth(), |depth| depth.set(depth.get() - 1));

    let mut natives = Vec::with_capacity(args.len());
    for arg in args {
        match convert::export(core, home, arg) {
            Ok(native) => natives.push(native),
            Err(error) => {
                for native in natives {
                    home.discard(native);
                }
                return Err(error);
            }
        }
    }

    trace!(
        scope = %core.id(),
        handle = %handle.id(),
        args = natives.len(),
        depth = depth + 1,
        "forwarding call"
    );
    let result = home.call(object, natives.clone());
    for native in natives {
        home.discard(native);
    }

    let returned = result.map_err(BridgeError::from_call)?;
    let converted = convert::import(core, home, &returned);
    home.discard(returned);
    converted
}
