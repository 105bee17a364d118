//! Bridge runtime and owning scopes.
//!
//! A [`BridgeRuntime`] is created once and handed to every scope; it holds
//! what would otherwise be process-wide state (the initialized flag, scope id
//! allocation, the registry of live scopes).
//!
//! A [`Scope`] binds one interpreter (Side A) to one engine (Side B). It
//! owns the identity caches for both sides and installs host bindings on both
//! runtimes so script on either side can read, write and call wrapped objects
//! of the other. Tearing the scope down invalidates every handle it produced
//! and releases every counted reference it took.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use isthmus_core::{
    BridgeConfig, Capabilities, Direction, ForeignValue, GatePolicy, HandleId, HostDispatch,
    HostRef, Kind, Liveness, ObjectId, Runtime, RuntimeError, RuntimeResult, ScopeId, Side,
    WrapperRef,
};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::cache::IdentityCache;
use crate::convert;
use crate::error::{
    BridgeError, BridgeResult, CallFailure, ConversionFailure, HandleFault, SetupFault,
};
use crate::gate::{self, NativeView};
use crate::stats::{BridgeStats, BridgeStatsSnapshot};
use crate::wrapper;

/// Lifecycle hook the runtime uses to close scopes on shutdown.
trait ScopeLifecycle {
    fn teardown(&self);
}

/// Holder of bridge-wide state, shared by every scope.
pub struct BridgeRuntime {
    initialized: Cell<bool>,
    next_scope: Cell<u32>,
    scopes: RefCell<FxHashMap<ScopeId, Weak<dyn ScopeLifecycle>>>,
}

impl BridgeRuntime {
    /// Create an uninitialized runtime. Scopes cannot be opened until
    /// [`initialize`](Self::initialize) has been called.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            initialized: Cell::new(false),
            next_scope: Cell::new(1),
            scopes: RefCell::new(FxHashMap::default()),
        })
    }

    /// Create a runtime that is ready for use.
    pub fn initialized() -> Rc<Self> {
        let runtime = Self::new();
        runtime.initialize();
        runtime
    }

    pub fn initialize(&self) {
        if !self.initialized.replace(true) {
            debug!("bridge runtime initialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// Tear down every live scope and refuse further work. Returns the
    /// number of scopes closed.
    pub fn shutdown(&self) -> usize {
        self.initialized.set(false);
        let scopes: Vec<_> = self.scopes.borrow_mut().drain().collect();
        let mut closed = 0;
        for (_, scope) in scopes {
            if let Some(scope) = scope.upgrade() {
                scope.teardown();
                closed += 1;
            }
        }
        debug!(closed, "bridge runtime shut down");
        closed
    }

    pub fn live_scopes(&self) -> usize {
        self.scopes.borrow().len()
    }

    fn allocate_scope(&self) -> BridgeResult<ScopeId> {
        if !self.is_initialized() {
            return Err(BridgeError::UninitializedBridge(SetupFault::NotInitialized));
        }
        let id = ScopeId::from_raw(self.next_scope.get());
        self.next_scope.set(id.as_raw() + 1);
        Ok(id)
    }

    fn register(&self, id: ScopeId, scope: Weak<dyn ScopeLifecycle>) {
        self.scopes.borrow_mut().insert(id, scope);
    }

    fn unregister(&self, id: ScopeId) {
        self.scopes.borrow_mut().remove(&id);
    }
}

/// Runtime-independent state of one scope, shared by the converter and the
/// wrapper operations.
pub(crate) struct ScopeCore {
    id: ScopeId,
    config: BridgeConfig,
    liveness: Liveness,
    stats: Arc<BridgeStats>,
    interpreter_objects: RefCell<IdentityCache>,
    engine_objects: RefCell<IdentityCache>,
    next_handle: Cell<u64>,
    call_depth: Cell<usize>,
}

impl ScopeCore {
    fn new(id: ScopeId, config: BridgeConfig) -> Self {
        Self {
            id,
            config,
            liveness: Liveness::new(),
            stats: Arc::new(BridgeStats::new()),
            interpreter_objects: RefCell::new(IdentityCache::new(Side::Interpreter, id)),
            engine_objects: RefCell::new(IdentityCache::new(Side::Engine, id)),
            next_handle: Cell::new(1),
            call_depth: Cell::new(0),
        }
    }

    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    pub(crate) fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub(crate) fn is_live(&self) -> bool {
        self.liveness.is_live()
    }

    /// Identity cache for objects owned by `side`.
    pub(crate) fn cache(&self, side: Side) -> &RefCell<IdentityCache> {
        match side {
            Side::Interpreter => &self.interpreter_objects,
            Side::Engine => &self.engine_objects,
        }
    }

    pub(crate) fn next_handle(&self) -> HandleId {
        let id = self.next_handle.get();
        self.next_handle.set(id + 1);
        HandleId::from_raw(id)
    }

    pub(crate) fn call_depth(&self) -> &Cell<usize> {
        &self.call_depth
    }

    fn gate(&self) -> &GatePolicy {
        &self.config.gate
    }
}

/// Shared state behind a [`Scope`] handle.
pub(crate) struct ScopeInner<A: Runtime, B: Runtime> {
    pub(crate) core: ScopeCore,
    pub(crate) a: Rc<A>,
    pub(crate) b: Rc<B>,
    runtime: Rc<BridgeRuntime>,
    a_host: Rc<InterpreterHost<A, B>>,
    b_host: Rc<EngineHost<A, B>>,
}

/// An owning scope binding one interpreter to one engine.
///
/// Cloning gives another handle to the same scope.
pub struct Scope<A: Runtime, B: Runtime> {
    inner: Rc<ScopeInner<A, B>>,
}

impl<A: Runtime, B: Runtime> Clone for Scope<A, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Runtime, B: Runtime> Scope<A, B> {
    /// Open a scope. The configuration is copied and fixed for the lifetime
    /// of the scope.
    pub fn open(
        runtime: &Rc<BridgeRuntime>,
        a: Rc<A>,
        b: Rc<B>,
        config: BridgeConfig,
    ) -> BridgeResult<Self> {
        config
            .validate()
            .map_err(|e| BridgeError::UninitializedBridge(SetupFault::InvalidConfig(e.to_string())))?;
        let id = runtime.allocate_scope()?;

        let inner = Rc::new_cyclic(|weak: &Weak<ScopeInner<A, B>>| ScopeInner {
            core: ScopeCore::new(id, config),
            a,
            b,
            runtime: runtime.clone(),
            a_host: Rc::new(InterpreterHost {
                scope: weak.clone(),
            }),
            b_host: Rc::new(EngineHost {
                scope: weak.clone(),
            }),
        });

        let a_host: Rc<dyn HostDispatch<A::Value>> = inner.a_host.clone();
        let b_host: Rc<dyn HostDispatch<B::Value>> = inner.b_host.clone();
        inner.a.attach_host(id, Rc::downgrade(&a_host));
        inner.b.attach_host(id, Rc::downgrade(&b_host));

        let lifecycle: Rc<dyn ScopeLifecycle> = inner.clone();
        runtime.register(id, Rc::downgrade(&lifecycle));

        debug!(
            scope = %id,
            allow_callable_passing = config.gate.allow_callable_passing,
            allow_composite_objects = config.gate.allow_composite_objects,
            gate_max_depth = config.gate.max_depth,
            max_conversion_depth = config.max_conversion_depth,
            max_call_depth = config.max_call_depth,
            "scope opened"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> ScopeId {
        self.inner.core.id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.core.config
    }

    pub fn interpreter(&self) -> &Rc<A> {
        &self.inner.a
    }

    pub fn engine(&self) -> &Rc<B> {
        &self.inner.b
    }

    pub fn is_live(&self) -> bool {
        self.inner.core.is_live()
    }

    /// Read-only snapshot of this scope's counters.
    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.inner.core.stats.snapshot()
    }

    /// Live counters, shared with anything that wants to poll them.
    pub fn stats_handle(&self) -> Arc<BridgeStats> {
        self.inner.core.stats.clone()
    }

    /// Number of wrappers cached for objects owned by `side`.
    pub fn cached_wrappers(&self, side: Side) -> usize {
        self.inner.core.cache(side).borrow().len()
    }

    /// Current nesting of foreign calls.
    pub fn call_depth(&self) -> usize {
        self.inner.core.call_depth.get()
    }

    pub(crate) fn inner(&self) -> &ScopeInner<A, B> {
        &self.inner
    }

    /// Run a public operation: refuse it on a closed scope and count its
    /// failure. A handle from a torn-down scope is reported as such.
    pub(crate) fn run<T>(
        &self,
        handle: Option<&WrapperRef>,
        op: impl FnOnce(&ScopeInner<A, B>) -> BridgeResult<T>,
    ) -> BridgeResult<T> {
        self.run_carrying(handle, &[], op)
    }

    /// Like [`run`](Self::run), also refusing wrappers from a torn-down
    /// scope anywhere inside `values`.
    pub(crate) fn run_carrying<T>(
        &self,
        handle: Option<&WrapperRef>,
        values: &[&ForeignValue],
        op: impl FnOnce(&ScopeInner<A, B>) -> BridgeResult<T>,
    ) -> BridgeResult<T> {
        let inner = &*self.inner;
        refuse_torn_down(handle, values)?;
        inner.ensure_open()?;
        let result = op(inner);
        if let Err(error) = &result {
            inner.core.stats.record_failure(error);
        }
        result
    }

    // ---------------------------------------------------------------------
    // Conversion
    // ---------------------------------------------------------------------

    /// Convert an interpreter value into a new engine value.
    pub fn to_b(&self, value: &A::Value) -> BridgeResult<B::Value> {
        self.run(None, |inner| inner.cross(&inner.a, &inner.b, value))
    }

    /// Convert an engine value into a new interpreter value.
    pub fn to_a(&self, value: &B::Value) -> BridgeResult<A::Value> {
        self.run(None, |inner| inner.cross(&inner.b, &inner.a, value))
    }

    /// Classify an interpreter value, wrapping objects.
    pub fn import_a(&self, value: &A::Value) -> BridgeResult<ForeignValue> {
        self.run(None, |inner| inner.import_checked(&inner.a, value))
    }

    /// Classify an engine value, wrapping objects.
    pub fn import_b(&self, value: &B::Value) -> BridgeResult<ForeignValue> {
        self.run(None, |inner| inner.import_checked(&inner.b, value))
    }

    /// Materialize a value on the interpreter side.
    pub fn export_to_a(&self, value: &ForeignValue) -> BridgeResult<A::Value> {
        self.run_carrying(None, &[value], |inner| inner.export_checked(&inner.a, value))
    }

    /// Materialize a value on the engine side.
    pub fn export_to_b(&self, value: &ForeignValue) -> BridgeResult<B::Value> {
        self.run_carrying(None, &[value], |inner| inner.export_checked(&inner.b, value))
    }

    // ---------------------------------------------------------------------
    // Wrappers
    // ---------------------------------------------------------------------

    /// Wrapper for an interpreter object.
    pub fn wrap_a(&self, value: &A::Value) -> BridgeResult<WrapperRef> {
        self.run(None, |inner| inner.wrap_value(&inner.a, value))
    }

    /// Wrapper for an engine object.
    pub fn wrap_b(&self, value: &B::Value) -> BridgeResult<WrapperRef> {
        self.run(None, |inner| inner.wrap_value(&inner.b, value))
    }

    /// Checked downcast: the object `handle` wraps, if it is still valid and
    /// grants `required`.
    pub fn unwrap(&self, handle: &WrapperRef, required: Capabilities) -> BridgeResult<ObjectId> {
        self.run(Some(handle), |inner| {
            if handle.side() == A::SIDE {
                wrapper::unwrap::<A>(&inner.core, handle, required)
            } else {
                wrapper::unwrap::<B>(&inner.core, handle, required)
            }
        })
    }

    pub fn get(&self, handle: &WrapperRef, key: &str) -> BridgeResult<ForeignValue> {
        self.run(Some(handle), |inner| inner.get(handle, key))
    }

    pub fn set(&self, handle: &WrapperRef, key: &str, value: &ForeignValue) -> BridgeResult<()> {
        self.run_carrying(Some(handle), &[value], |inner| inner.set(handle, key, value))
    }

    pub fn keys(&self, handle: &WrapperRef) -> BridgeResult<Vec<String>> {
        self.run(Some(handle), |inner| {
            if handle.side() == A::SIDE {
                wrapper::keys(&inner.core, &inner.a, handle)
            } else {
                wrapper::keys(&inner.core, &inner.b, handle)
            }
        })
    }

    /// Invoke a wrapped callable with runtime-neutral arguments.
    pub fn call(&self, handle: &WrapperRef, args: &[ForeignValue]) -> BridgeResult<ForeignValue> {
        let carried: Vec<_> = args.iter().collect();
        self.run_carrying(Some(handle), &carried, |inner| inner.call(handle, args))
    }

    /// Call a wrapped engine object as a function from interpreter code.
    pub fn call_from_a(&self, callee: &WrapperRef, args: &[A::Value]) -> BridgeResult<A::Value> {
        self.run(Some(callee), |inner| {
            inner.call_foreign(&inner.a, &inner.b, callee, args)
        })
    }

    /// Call a wrapped interpreter object as a function from engine code.
    pub fn call_from_b(&self, callee: &WrapperRef, args: &[B::Value]) -> BridgeResult<B::Value> {
        self.run(Some(callee), |inner| {
            inner.call_foreign(&inner.b, &inner.a, callee, args)
        })
    }

    /// Call the engine global function `name` with interpreter arguments.
    pub fn call_b_function(&self, name: &str, args: &[A::Value]) -> BridgeResult<A::Value> {
        self.run(None, |inner| inner.call_named(&inner.a, &inner.b, name, args))
    }

    /// Call the interpreter global function `name` with engine arguments.
    pub fn call_a_function(&self, name: &str, args: &[B::Value]) -> BridgeResult<B::Value> {
        self.run(None, |inner| inner.call_named(&inner.b, &inner.a, name, args))
    }

    /// Bind the engine's global object into the interpreter's globals as
    /// `name`, so interpreter code can reach engine objects through it.
    pub fn expose_global(&self, name: &str) -> BridgeResult<WrapperRef> {
        self.run(None, |inner| {
            let global = inner
                .b
                .value_of_object(inner.b.global_object())
                .map_err(|e| BridgeError::property(name, e))?;
            let handle = inner.wrap_value(&inner.b, &global);
            inner.b.discard(global);
            let handle = handle?;

            let foreign = ForeignValue::Opaque(handle.clone());
            gate::check(inner.core.gate(), &foreign, Direction::BToA)?;
            let host = convert::export(&inner.core, &inner.a, &foreign)?;
            let bound = inner
                .a
                .set_property(inner.a.global_object(), name, host.clone());
            inner.a.discard(host);
            bound.map_err(|e| BridgeError::property(name, e))?;

            debug!(scope = %inner.core.id, name, handle = %handle.id(), "engine global exposed");
            Ok(handle)
        })
    }

    /// Invalidate every handle of this scope and release every counted
    /// reference it holds. Idempotent.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

/// Refuse `handle`, or any wrapper carried inside `values`, once its scope
/// has been torn down.
pub(crate) fn refuse_torn_down(
    handle: Option<&WrapperRef>,
    values: &[&ForeignValue],
) -> BridgeResult<()> {
    let torn_down = handle
        .filter(|handle| !handle.is_live())
        .or_else(|| values.iter().find_map(|value| torn_down_wrapper(value)));
    match torn_down {
        Some(handle) => Err(BridgeError::invalid_handle(
            handle.id(),
            HandleFault::ScopeTornDown,
        )),
        None => Ok(()),
    }
}

/// First wrapper inside `value` whose scope has been torn down.
fn torn_down_wrapper(value: &ForeignValue) -> Option<&WrapperRef> {
    match value {
        ForeignValue::Callable(handle) | ForeignValue::Opaque(handle) => {
            (!handle.is_live()).then_some(handle)
        }
        ForeignValue::Array(items) => items.iter().find_map(torn_down_wrapper),
        ForeignValue::Mapping(entries) => entries.values().find_map(torn_down_wrapper),
        _ => None,
    }
}

impl<A: Runtime, B: Runtime> ScopeInner<A, B> {
    pub(crate) fn ensure_open(&self) -> BridgeResult<()> {
        if !self.runtime.is_initialized() {
            return Err(BridgeError::UninitializedBridge(SetupFault::NotInitialized));
        }
        if !self.core.is_live() {
            return Err(BridgeError::UninitializedBridge(SetupFault::ScopeClosed(
                self.core.id,
            )));
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> &BridgeStats {
        &self.core.stats
    }

    pub(crate) fn gate_foreign(&self, value: &ForeignValue, direction: Direction) -> BridgeResult<()> {
        gate::check(self.core.gate(), value, direction)
    }

    /// Gate and import a native value.
    pub(crate) fn import_checked<R: Runtime>(
        &self,
        runtime: &Rc<R>,
        value: &R::Value,
    ) -> BridgeResult<ForeignValue> {
        let direction = Direction::from_source(R::SIDE);
        gate::check(
            self.core.gate(),
            &NativeView::new(&**runtime, value.clone()),
            direction,
        )?;
        convert::import(&self.core, runtime, value)
    }

    /// Gate and export a runtime-neutral value.
    pub(crate) fn export_checked<R: Runtime>(
        &self,
        runtime: &Rc<R>,
        value: &ForeignValue,
    ) -> BridgeResult<R::Value> {
        let direction = Direction::from_source(R::SIDE).reverse();
        gate::check(self.core.gate(), value, direction)?;
        convert::export(&self.core, runtime, value)
    }

    /// Full crossing of one value: gate, import, export, count and time.
    fn cross<From: Runtime, To: Runtime>(
        &self,
        from: &Rc<From>,
        to: &Rc<To>,
        value: &From::Value,
    ) -> BridgeResult<To::Value> {
        let started = Instant::now();
        let foreign = self.import_checked(from, value)?;
        let converted = convert::export(&self.core, to, &foreign)?;
        self.core
            .stats
            .record_conversion(Direction::from_source(From::SIDE), Some(started.elapsed()));
        Ok(converted)
    }

    fn wrap_value<R: Runtime>(&self, runtime: &Rc<R>, value: &R::Value) -> BridgeResult<WrapperRef> {
        let kind = runtime.kind_of(value);
        if !matches!(kind, Kind::Callable | Kind::Opaque) {
            return Err(BridgeError::conversion("$", ConversionFailure::NoMapping(kind)));
        }
        match convert::import(&self.core, runtime, value)? {
            ForeignValue::Callable(handle) | ForeignValue::Opaque(handle) => Ok(handle),
            other => Err(BridgeError::conversion(
                "$",
                ConversionFailure::NoMapping(other.kind()),
            )),
        }
    }

    pub(crate) fn get(&self, handle: &WrapperRef, key: &str) -> BridgeResult<ForeignValue> {
        let value = if handle.side() == A::SIDE {
            wrapper::get(&self.core, &self.a, handle, key)?
        } else {
            wrapper::get(&self.core, &self.b, handle, key)?
        };
        self.gate_foreign(&value, Direction::from_source(handle.side()))?;
        Ok(value)
    }

    pub(crate) fn set(&self, handle: &WrapperRef, key: &str, value: &ForeignValue) -> BridgeResult<()> {
        self.gate_foreign(value, Direction::from_source(handle.side()).reverse())?;
        if handle.side() == A::SIDE {
            wrapper::set(&self.core, &self.a, handle, key, value)
        } else {
            wrapper::set(&self.core, &self.b, handle, key, value)
        }
    }

    pub(crate) fn call(
        &self,
        handle: &WrapperRef,
        args: &[ForeignValue],
    ) -> BridgeResult<ForeignValue> {
        let inbound = Direction::from_source(handle.side()).reverse();
        for arg in args {
            self.gate_foreign(arg, inbound)?;
        }
        let result = if handle.side() == A::SIDE {
            wrapper::call(&self.core, &self.a, handle, args)?
        } else {
            wrapper::call(&self.core, &self.b, handle, args)?
        };
        self.gate_foreign(&result, inbound.reverse())?;
        Ok(result)
    }

    /// Call a `Home` object from `Caller` code with native arguments.
    pub(crate) fn call_foreign<Caller: Runtime, Home: Runtime>(
        &self,
        caller: &Rc<Caller>,
        home: &Rc<Home>,
        callee: &WrapperRef,
        args: &[Caller::Value],
    ) -> BridgeResult<Caller::Value> {
        if callee.side() != Home::SIDE {
            return Err(BridgeError::invalid_handle(
                callee.id(),
                HandleFault::WrongSide(callee.side()),
            ));
        }
        let outbound = Direction::from_source(Caller::SIDE);

        let mut foreign_args = Vec::with_capacity(args.len());
        for arg in args {
            foreign_args.push(self.import_checked(caller, arg)?);
        }
        let result = wrapper::call(&self.core, home, callee, &foreign_args)?;
        let converted = self.export_checked(caller, &result)?;

        for _ in &foreign_args {
            self.core.stats.record_conversion(outbound, None);
        }
        self.core.stats.record_conversion(outbound.reverse(), None);
        Ok(converted)
    }

    fn call_named<Caller: Runtime, Home: Runtime>(
        &self,
        caller: &Rc<Caller>,
        home: &Rc<Home>,
        name: &str,
        args: &[Caller::Value],
    ) -> BridgeResult<Caller::Value> {
        let function = home
            .get_property(home.global_object(), name)
            .map_err(|e| BridgeError::property(name, e))?;
        let callable = home
            .object_id_of(&function)
            .is_some_and(|object| home.is_callable(object));
        if !callable {
            home.discard(function);
            return Err(BridgeError::Call(CallFailure::NotCallable(
                name.to_string(),
            )));
        }
        let handle = self.wrap_value(home, &function);
        home.discard(function);
        self.call_foreign(caller, home, &handle?, args)
    }

    /// Wrapper behind a host object that script on the other side touched.
    fn resolve_host(&self, host: HostRef, home: Side) -> BridgeResult<WrapperRef> {
        if !self.core.is_live() {
            return Err(BridgeError::invalid_handle(
                host.handle,
                HandleFault::ScopeTornDown,
            ));
        }
        self.core
            .cache(home)
            .borrow()
            .by_handle(host.handle)
            .ok_or_else(|| BridgeError::invalid_handle(host.handle, HandleFault::Evicted))
    }

    /// Property read from `Caller` script on a host object for a `Home` object.
    fn host_get<Caller: Runtime, Home: Runtime>(
        &self,
        caller: &Rc<Caller>,
        home: &Rc<Home>,
        host: HostRef,
        key: &str,
    ) -> BridgeResult<Caller::Value> {
        let handle = self.resolve_host(host, Home::SIDE)?;
        let value = wrapper::get(&self.core, home, &handle, key)?;
        self.export_checked(caller, &value)
    }

    fn host_set<Caller: Runtime, Home: Runtime>(
        &self,
        caller: &Rc<Caller>,
        home: &Rc<Home>,
        host: HostRef,
        key: &str,
        value: &Caller::Value,
    ) -> BridgeResult<()> {
        let handle = self.resolve_host(host, Home::SIDE)?;
        let value = self.import_checked(caller, value)?;
        wrapper::set(&self.core, home, &handle, key, &value)
    }

    fn host_keys<Home: Runtime>(&self, home: &Rc<Home>, host: HostRef) -> BridgeResult<Vec<String>> {
        let handle = self.resolve_host(host, Home::SIDE)?;
        wrapper::keys(&self.core, home, &handle)
    }

    fn host_call<Caller: Runtime, Home: Runtime>(
        &self,
        caller: &Rc<Caller>,
        home: &Rc<Home>,
        host: HostRef,
        args: &[Caller::Value],
    ) -> BridgeResult<Caller::Value> {
        let handle = self.resolve_host(host, Home::SIDE)?;
        self.call_foreign(caller, home, &handle, args)
    }

    /// Report a failure raised inside a host callback back to script.
    fn host_failure(&self, error: BridgeError) -> RuntimeError {
        self.core.stats.record_failure(&error);
        error.into_runtime_error()
    }

    fn teardown(&self) {
        if !self.core.is_live() {
            return;
        }
        self.core.liveness.revoke();
        self.a.detach_host(self.core.id);
        self.b.detach_host(self.core.id);

        if self.core.call_depth.get() > 0 {
            warn!(
                scope = %self.core.id,
                depth = self.core.call_depth.get(),
                "scope torn down during a foreign call"
            );
        }

        let interpreter_refs = self.core.interpreter_objects.borrow_mut().evict_all();
        let engine_refs = self.core.engine_objects.borrow_mut().evict_all();
        let released = interpreter_refs.len() + engine_refs.len();
        drop(interpreter_refs);
        drop(engine_refs);

        self.runtime.unregister(self.core.id);
        debug!(scope = %self.core.id, released, "scope torn down");
    }
}

impl<A: Runtime, B: Runtime> ScopeLifecycle for ScopeInner<A, B> {
    fn teardown(&self) {
        ScopeInner::teardown(self);
    }
}

impl<A: Runtime, B: Runtime> Drop for ScopeInner<A, B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Host binding installed on the interpreter: script there touching a host
/// object reaches the engine object it stands for.
struct InterpreterHost<A: Runtime, B: Runtime> {
    scope: Weak<ScopeInner<A, B>>,
}

/// Host binding installed on the engine.
struct EngineHost<A: Runtime, B: Runtime> {
    scope: Weak<ScopeInner<A, B>>,
}

fn upgrade<A: Runtime, B: Runtime>(
    scope: &Weak<ScopeInner<A, B>>,
    host: HostRef,
) -> RuntimeResult<Rc<ScopeInner<A, B>>> {
    scope.upgrade().ok_or(RuntimeError::Revoked(host.scope))
}

impl<A: Runtime, B: Runtime> HostDispatch<A::Value> for InterpreterHost<A, B> {
    fn get(&self, host: HostRef, key: &str) -> RuntimeResult<A::Value> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_get(&scope.a, &scope.b, host, key)
            .map_err(|e| scope.host_failure(e))
    }

    fn set(&self, host: HostRef, key: &str, value: A::Value) -> RuntimeResult<()> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_set(&scope.a, &scope.b, host, key, &value)
            .map_err(|e| scope.host_failure(e))
    }

    fn call(&self, host: HostRef, args: Vec<A::Value>) -> RuntimeResult<A::Value> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_call(&scope.a, &scope.b, host, &args)
            .map_err(|e| scope.host_failure(e))
    }

    fn keys(&self, host: HostRef) -> RuntimeResult<Vec<String>> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_keys(&scope.b, host)
            .map_err(|e| scope.host_failure(e))
    }
}

impl<A: Runtime, B: Runtime> HostDispatch<B::Value> for EngineHost<A, B> {
    fn get(&self, host: HostRef, key: &str) -> RuntimeResult<B::Value> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_get(&scope.b, &scope.a, host, key)
            .map_err(|e| scope.host_failure(e))
    }

    fn set(&self, host: HostRef, key: &str, value: B::Value) -> RuntimeResult<()> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_set(&scope.b, &scope.a, host, key, &value)
            .map_err(|e| scope.host_failure(e))
    }

    fn call(&self, host: HostRef, args: Vec<B::Value>) -> RuntimeResult<B::Value> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_call(&scope.b, &scope.a, host, &args)
            .map_err(|e| scope.host_failure(e))
    }

    fn keys(&self, host: HostRef) -> RuntimeResult<Vec<String>> {
        let scope = upgrade(&self.scope, host)?;
        scope
            .host_keys(&scope.a, host)
            .map_err(|e| scope.host_failure(e))
    }
}
