//! Bridge facade.
//!
//! [`Bridge`] is the single entry point the rest of an application talks to.
//! On top of a [`Scope`] it adds named message handlers with a FIFO queue for
//! messages nobody handles yet, and named events fanned out to listeners in
//! registration order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::IndexMap;
use isthmus_core::{
    BridgeConfig, Capabilities, Direction, ForeignValue, Runtime, RuntimeResult, WrapperRef,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::convert;
use crate::error::{BridgeError, BridgeResult, HandleFault};
use crate::scope::{self, BridgeRuntime, Scope, ScopeInner};
use crate::stats::BridgeStatsSnapshot;

type NativeHandler<R> =
    Rc<dyn Fn(&R, &<R as Runtime>::Value) -> RuntimeResult<<R as Runtime>::Value>>;

type NativeListener<R> = Rc<dyn Fn(&R, &<R as Runtime>::Value) -> RuntimeResult<()>>;

/// Receiver of a message type in one direction.
enum Route<A: Runtime, B: Runtime> {
    Interpreter(NativeHandler<A>),
    Engine(NativeHandler<B>),
    Foreign(WrapperRef),
}

impl<A: Runtime, B: Runtime> Clone for Route<A, B> {
    fn clone(&self) -> Self {
        match self {
            Route::Interpreter(handler) => Route::Interpreter(handler.clone()),
            Route::Engine(handler) => Route::Engine(handler.clone()),
            Route::Foreign(handle) => Route::Foreign(handle.clone()),
        }
    }
}

enum Listener<A: Runtime, B: Runtime> {
    Interpreter(NativeListener<A>),
    Engine(NativeListener<B>),
    Foreign(WrapperRef),
}

impl<A: Runtime, B: Runtime> Clone for Listener<A, B> {
    fn clone(&self) -> Self {
        match self {
            Listener::Interpreter(listener) => Listener::Interpreter(listener.clone()),
            Listener::Engine(listener) => Listener::Engine(listener.clone()),
            Listener::Foreign(handle) => Listener::Foreign(handle.clone()),
        }
    }
}

/// A message that found no handler when it was sent.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Position in enqueue order.
    pub sequence: u64,
    pub message_type: String,
    pub direction: Direction,
    pub payload: ForeignValue,
    pub processed: bool,
}

impl MessageEnvelope {
    /// Payload, if the message was sent by the interpreter.
    pub fn payload_from_a(&self) -> Option<&ForeignValue> {
        (self.direction == Direction::AToB).then_some(&self.payload)
    }

    /// Payload, if the message was sent by the engine.
    pub fn payload_from_b(&self) -> Option<&ForeignValue> {
        (self.direction == Direction::BToA).then_some(&self.payload)
    }
}

/// Outcome of redelivering one queued envelope.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: MessageEnvelope,
    pub result: BridgeResult<ForeignValue>,
}

/// One listener that failed during an `emit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerFailure {
    /// Position of the listener in registration order.
    pub index: usize,
    #[serde(serialize_with = "display")]
    pub error: BridgeError,
}

fn display<S: serde::Serializer>(error: &BridgeError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Aggregate result of one event fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmitReport {
    pub event: String,
    /// Listeners that ran to completion.
    pub delivered: usize,
    pub failures: Vec<ListenerFailure>,
}

impl EmitReport {
    /// True when every listener succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn listeners(&self) -> usize {
        self.delivered + self.failures.len()
    }
}

/// Facade over one scope: conversion, calls, messages and events.
pub struct Bridge<A: Runtime, B: Runtime> {
    scope: Scope<A, B>,
    handlers: RefCell<FxHashMap<(Direction, String), Route<A, B>>>,
    queue: RefCell<VecDeque<MessageEnvelope>>,
    next_sequence: Cell<u64>,
    listeners: RefCell<IndexMap<String, Vec<Listener<A, B>>>>,
}

impl<A: Runtime, B: Runtime> Bridge<A, B> {
    /// Open a new scope over `a` and `b` and put a facade on it.
    pub fn new(
        runtime: &Rc<BridgeRuntime>,
        a: Rc<A>,
        b: Rc<B>,
        config: BridgeConfig,
    ) -> BridgeResult<Self> {
        Ok(Self::from_scope(Scope::open(runtime, a, b, config)?))
    }

    pub fn from_scope(scope: Scope<A, B>) -> Self {
        Self {
            scope,
            handlers: RefCell::new(FxHashMap::default()),
            queue: RefCell::new(VecDeque::new()),
            next_sequence: Cell::new(1),
            listeners: RefCell::new(IndexMap::new()),
        }
    }

    pub fn scope(&self) -> &Scope<A, B> {
        &self.scope
    }

    pub fn get_stats(&self) -> BridgeStatsSnapshot {
        self.scope.stats()
    }

    // ---------------------------------------------------------------------
    // Conversion and calls
    // ---------------------------------------------------------------------

    pub fn to_b(&self, value: &A::Value) -> BridgeResult<B::Value> {
        self.scope.to_b(value)
    }

    pub fn to_a(&self, value: &B::Value) -> BridgeResult<A::Value> {
        self.scope.to_a(value)
    }

    /// Call the engine global function `name`.
    pub fn call_b_function(&self, name: &str, args: &[A::Value]) -> BridgeResult<A::Value> {
        self.scope.call_b_function(name, args)
    }

    /// Call the interpreter global function `name`.
    pub fn call_a_function(&self, name: &str, args: &[B::Value]) -> BridgeResult<B::Value> {
        self.scope.call_a_function(name, args)
    }

    pub fn call_from_a(&self, callee: &WrapperRef, args: &[A::Value]) -> BridgeResult<A::Value> {
        self.scope.call_from_a(callee, args)
    }

    pub fn call_from_b(&self, callee: &WrapperRef, args: &[B::Value]) -> BridgeResult<B::Value> {
        self.scope.call_from_b(callee, args)
    }

    pub fn expose_global(&self, name: &str) -> BridgeResult<WrapperRef> {
        self.scope.expose_global(name)
    }

    // ---------------------------------------------------------------------
    // Message handlers
    // ---------------------------------------------------------------------

    /// Handle `message_type` sent from the interpreter with a native engine
    /// closure. Replaces any handler already registered for it.
    pub fn register_handler_b(
        &self,
        message_type: impl Into<String>,
        handler: impl Fn(&B, &B::Value) -> RuntimeResult<B::Value> + 'static,
    ) {
        self.install(Direction::AToB, message_type.into(), Route::Engine(Rc::new(handler)));
    }

    /// Handle `message_type` sent from the engine with a native interpreter
    /// closure.
    pub fn register_handler_a(
        &self,
        message_type: impl Into<String>,
        handler: impl Fn(&A, &A::Value) -> RuntimeResult<A::Value> + 'static,
    ) {
        self.install(
            Direction::BToA,
            message_type.into(),
            Route::Interpreter(Rc::new(handler)),
        );
    }

    /// Handle `message_type` travelling in `direction` with a wrapped
    /// callable living on the receiving side.
    pub fn register_foreign_handler(
        &self,
        direction: Direction,
        message_type: impl Into<String>,
        handler: &WrapperRef,
    ) -> BridgeResult<()> {
        self.scope.unwrap(handler, Capabilities::CALL)?;
        if handler.side() != direction.target() {
            return Err(BridgeError::invalid_handle(
                handler.id(),
                HandleFault::WrongSide(handler.side()),
            ));
        }
        self.install(direction, message_type.into(), Route::Foreign(handler.clone()));
        Ok(())
    }

    fn install(&self, direction: Direction, message_type: String, route: Route<A, B>) {
        let replaced = self
            .handlers
            .borrow_mut()
            .insert((direction, message_type.clone()), route)
            .is_some();
        debug!(
            scope = %self.scope.id(),
            direction = %direction,
            message_type,
            replaced,
            "message handler registered"
        );
    }

    /// Remove the handler for `message_type` in `direction`. Returns whether
    /// one was registered.
    pub fn unregister_handler(&self, direction: Direction, message_type: &str) -> bool {
        self.handlers
            .borrow_mut()
            .remove(&(direction, message_type.to_string()))
            .is_some()
    }

    pub fn has_handler(&self, direction: Direction, message_type: &str) -> bool {
        self.handlers
            .borrow()
            .contains_key(&(direction, message_type.to_string()))
    }

    fn route(&self, direction: Direction, message_type: &str) -> Option<Route<A, B>> {
        self.handlers
            .borrow()
            .get(&(direction, message_type.to_string()))
            .cloned()
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    /// Send `payload` in `direction`.
    ///
    /// With a handler registered the handler runs now and its result is
    /// returned. Otherwise the message is queued and `Null` is returned.
    pub fn send(
        &self,
        direction: Direction,
        payload: ForeignValue,
        message_type: &str,
    ) -> BridgeResult<ForeignValue> {
        scope::refuse_torn_down(None, &[&payload])?;
        self.scope.run(None, |inner| {
            inner.gate_foreign(&payload, direction)?;
            self.dispatch(inner, direction, payload, message_type)
        })
    }

    /// Send an interpreter value to the engine as `message_type`.
    pub fn send_to_b(&self, message_type: &str, payload: &A::Value) -> BridgeResult<A::Value> {
        self.scope.run(None, |inner| {
            let payload = inner.import_checked(&inner.a, payload)?;
            let result = self.dispatch(inner, Direction::AToB, payload, message_type)?;
            inner.export_checked(&inner.a, &result)
        })
    }

    /// Send an engine value to the interpreter as `message_type`.
    pub fn send_to_a(&self, message_type: &str, payload: &B::Value) -> BridgeResult<B::Value> {
        self.scope.run(None, |inner| {
            let payload = inner.import_checked(&inner.b, payload)?;
            let result = self.dispatch(inner, Direction::BToA, payload, message_type)?;
            inner.export_checked(&inner.b, &result)
        })
    }

    fn dispatch(
        &self,
        inner: &ScopeInner<A, B>,
        direction: Direction,
        payload: ForeignValue,
        message_type: &str,
    ) -> BridgeResult<ForeignValue> {
        inner.stats().record_message(direction);
        match self.route(direction, message_type) {
            Some(route) => self.deliver(inner, &route, direction, &payload),
            None => {
                self.enqueue(direction, payload, message_type);
                Ok(ForeignValue::Null)
            }
        }
    }

    fn deliver(
        &self,
        inner: &ScopeInner<A, B>,
        route: &Route<A, B>,
        direction: Direction,
        payload: &ForeignValue,
    ) -> BridgeResult<ForeignValue> {
        let result = match route {
            Route::Engine(handler) => invoke(inner, &inner.b, handler.as_ref(), payload)?,
            Route::Interpreter(handler) => invoke(inner, &inner.a, handler.as_ref(), payload)?,
            Route::Foreign(handle) => inner.call(handle, std::slice::from_ref(payload))?,
        };
        inner.gate_foreign(&result, direction.reverse())?;
        Ok(result)
    }

    fn enqueue(&self, direction: Direction, payload: ForeignValue, message_type: &str) {
        let sequence = self.next_sequence.get();
        self.next_sequence.set(sequence + 1);
        self.queue.borrow_mut().push_back(MessageEnvelope {
            sequence,
            message_type: message_type.to_string(),
            direction,
            payload,
            processed: false,
        });
        debug!(
            scope = %self.scope.id(),
            direction = %direction,
            message_type,
            sequence,
            "message queued"
        );
    }

    // ---------------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------------

    pub fn pending_messages(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Queued messages of `message_type`, oldest first, without consuming
    /// them.
    pub fn peek_messages(&self, message_type: &str) -> Vec<MessageEnvelope> {
        self.queue
            .borrow()
            .iter()
            .filter(|envelope| envelope.message_type == message_type)
            .cloned()
            .collect()
    }

    /// Take every queued message in enqueue order.
    pub fn drain_messages(&self) -> Vec<MessageEnvelope> {
        let drained: Vec<_> = self.queue.borrow_mut().drain(..).collect();
        drained
            .into_iter()
            .map(|mut envelope| {
                envelope.processed = true;
                envelope
            })
            .collect()
    }

    /// Hand queued messages to handlers registered since they were sent.
    ///
    /// Envelopes are visited in enqueue order and each is consumed at most
    /// once. Envelopes that still have no handler stay queued in their
    /// original order, ahead of anything queued while handlers ran.
    pub fn redeliver_pending(&self) -> BridgeResult<Vec<Delivery>> {
        self.scope.run(None, |inner| {
            let queued: Vec<_> = self.queue.borrow_mut().drain(..).collect();
            let mut waiting = VecDeque::new();
            let mut deliveries = Vec::new();

            for mut envelope in queued {
                let Some(route) = self.route(envelope.direction, &envelope.message_type) else {
                    waiting.push_back(envelope);
                    continue;
                };
                envelope.processed = true;
                let result = self.deliver(inner, &route, envelope.direction, &envelope.payload);
                if let Err(error) = &result {
                    inner.stats().record_failure(error);
                }
                trace!(
                    scope = %self.scope.id(),
                    sequence = envelope.sequence,
                    ok = result.is_ok(),
                    "queued message redelivered"
                );
                deliveries.push(Delivery { envelope, result });
            }

            let mut queue = self.queue.borrow_mut();
            let fresh = std::mem::replace(&mut *queue, waiting);
            queue.extend(fresh);
            Ok(deliveries)
        })
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Listen for `event` with an interpreter closure.
    pub fn listen_a(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&A, &A::Value) -> RuntimeResult<()> + 'static,
    ) {
        self.add_listener(event.into(), Listener::Interpreter(Rc::new(listener)));
    }

    /// Listen for `event` with an engine closure.
    pub fn listen_b(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&B, &B::Value) -> RuntimeResult<()> + 'static,
    ) {
        self.add_listener(event.into(), Listener::Engine(Rc::new(listener)));
    }

    /// Listen for `event` with a wrapped callable from either side.
    pub fn listen_foreign(&self, event: impl Into<String>, listener: &WrapperRef) -> BridgeResult<()> {
        self.scope.unwrap(listener, Capabilities::CALL)?;
        self.add_listener(event.into(), Listener::Foreign(listener.clone()));
        Ok(())
    }

    fn add_listener(&self, event: String, listener: Listener<A, B>) {
        let mut listeners = self.listeners.borrow_mut();
        let registered = listeners.entry(event.clone()).or_default();
        registered.push(listener);
        debug!(
            scope = %self.scope.id(),
            event,
            listeners = registered.len(),
            "event listener registered"
        );
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.borrow().get(event).map_or(0, Vec::len)
    }

    /// Fan `data` out to every listener of `event` in registration order.
    ///
    /// `data` is gated as a value leaving the interpreter. A failing listener
    /// does not stop the ones after it; failures are collected in the report.
    pub fn emit(&self, event: &str, data: ForeignValue) -> BridgeResult<EmitReport> {
        self.scope.run_carrying(None, &[&data], |inner| {
            inner.gate_foreign(&data, Direction::AToB)?;
            Ok(self.fan_out(inner, event, &data))
        })
    }

    /// Emit an interpreter value.
    pub fn emit_from_a(&self, event: &str, data: &A::Value) -> BridgeResult<EmitReport> {
        self.scope.run(None, |inner| {
            let data = inner.import_checked(&inner.a, data)?;
            Ok(self.fan_out(inner, event, &data))
        })
    }

    /// Emit an engine value.
    pub fn emit_from_b(&self, event: &str, data: &B::Value) -> BridgeResult<EmitReport> {
        self.scope.run(None, |inner| {
            let data = inner.import_checked(&inner.b, data)?;
            Ok(self.fan_out(inner, event, &data))
        })
    }

    fn fan_out(&self, inner: &ScopeInner<A, B>, event: &str, data: &ForeignValue) -> EmitReport {
        let listeners = self
            .listeners
            .borrow()
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut report = EmitReport {
            event: event.to_string(),
            delivered: 0,
            failures: Vec::new(),
        };
        for (index, listener) in listeners.iter().enumerate() {
            let outcome = match listener {
                Listener::Interpreter(listener) => notify(inner, &inner.a, listener.as_ref(), data),
                Listener::Engine(listener) => notify(inner, &inner.b, listener.as_ref(), data),
                Listener::Foreign(handle) => inner
                    .call(handle, std::slice::from_ref(data))
                    .map(|_| ()),
            };
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    inner.stats().record_failure(&error);
                    inner
                        .stats()
                        .listener_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!(
                        scope = %self.scope.id(),
                        event,
                        index,
                        error = %error,
                        "event listener failed"
                    );
                    report.failures.push(ListenerFailure { index, error });
                }
            }
        }

        inner
            .stats()
            .events_dispatched
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        trace!(
            scope = %self.scope.id(),
            event,
            delivered = report.delivered,
            failed = report.failures.len(),
            "event dispatched"
        );
        report
    }

    /// Tear the scope down and forget every handler, listener and queued
    /// message.
    pub fn teardown(&self) {
        self.handlers.borrow_mut().clear();
        self.listeners.borrow_mut().clear();
        self.queue.borrow_mut().clear();
        self.scope.teardown();
    }
}

/// Run a native handler on `runtime` with `payload` lowered into it.
fn invoke<A: Runtime, B: Runtime, R: Runtime>(
    inner: &ScopeInner<A, B>,
    runtime: &Rc<R>,
    handler: &dyn Fn(&R, &R::Value) -> RuntimeResult<R::Value>,
    payload: &ForeignValue,
) -> BridgeResult<ForeignValue> {
    let native = convert::export(&inner.core, runtime, payload)?;
    let returned = handler(runtime.as_ref(), &native);
    runtime.discard(native);
    let returned = returned.map_err(BridgeError::from_call)?;
    let result = convert::import(&inner.core, runtime, &returned);
    runtime.discard(returned);
    result
}

fn notify<A: Runtime, B: Runtime, R: Runtime>(
    inner: &ScopeInner<A, B>,
    runtime: &Rc<R>,
    listener: &dyn Fn(&R, &R::Value) -> RuntimeResult<()>,
    data: &ForeignValue,
) -> BridgeResult<()> {
    let native = convert::export(&inner.core, runtime, data)?;
    let outcome = listener(runtime.as_ref(), &native);
    runtime.discard(native);
    outcome.map_err(BridgeError::from_call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isthmus_core::GatePolicy;
    use isthmus_heap::{Engine, EngineValue, Interpreter, InterpreterValue};

    fn bridge() -> Bridge<Interpreter, Engine> {
        let runtime = BridgeRuntime::initialized();
        Bridge::new(
            &runtime,
            Rc::new(Interpreter::new()),
            Rc::new(Engine::new()),
            BridgeConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_unhandled_message_is_queued() {
        let bridge = bridge();
        let result = bridge
            .send(Direction::AToB, ForeignValue::from("hello"), "greet")
            .unwrap();
        assert!(result.is_null());
        assert_eq!(bridge.pending_messages(), 1);

        let drained = bridge.drain_messages();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].processed);
        assert_eq!(drained[0].payload_from_a(), Some(&ForeignValue::from("hello")));
        assert_eq!(drained[0].payload_from_b(), None);
        assert_eq!(bridge.pending_messages(), 0);
        assert_eq!(bridge.get_stats().messages_to_b, 1);
    }

    #[test]
    fn test_second_handler_replaces_first() {
        let bridge = bridge();
        bridge.register_handler_b("kind", |_, _| Ok(EngineValue::Number(1.0)));
        bridge.register_handler_b("kind", |_, _| Ok(EngineValue::Number(2.0)));
        let result = bridge
            .send(Direction::AToB, ForeignValue::Null, "kind")
            .unwrap();
        assert_eq!(result, ForeignValue::Number(2.0));
    }

    #[test]
    fn test_handler_error_surfaces() {
        let bridge = bridge();
        bridge.register_handler_a("fail", |_, _| {
            Err(isthmus_core::RuntimeError::thrown("ValueError", "nope"))
        });
        let err = bridge
            .send(Direction::BToA, ForeignValue::Null, "fail")
            .unwrap_err();
        assert_eq!(err.kind_name(), "CallError");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_redelivery_keeps_order() {
        let bridge = bridge();
        for (index, message_type) in ["a", "b", "a", "b"].iter().enumerate() {
            bridge
                .send(Direction::AToB, ForeignValue::from(index as i32), message_type)
                .unwrap();
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        bridge.register_handler_b("a", move |_, value| {
            if let EngineValue::Number(n) = value {
                sink.borrow_mut().push(*n);
            }
            Ok(EngineValue::Null)
        });

        let deliveries = bridge.redeliver_pending().unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|d| d.envelope.processed && d.result.is_ok()));
        assert_eq!(*seen.borrow(), vec![0.0, 2.0]);

        let left = bridge.peek_messages("b");
        assert_eq!(left.len(), 2);
        assert!(left[0].sequence < left[1].sequence);
        assert!(bridge.redeliver_pending().unwrap().is_empty());
        assert_eq!(bridge.pending_messages(), 2);
    }

    #[test]
    fn test_gate_runs_before_send() {
        let runtime = BridgeRuntime::initialized();
        let bridge: Bridge<Interpreter, Engine> = Bridge::new(
            &runtime,
            Rc::new(Interpreter::new()),
            Rc::new(Engine::new()),
            BridgeConfig::default().gate(GatePolicy::primitives_only()),
        )
        .unwrap();
        let err = bridge
            .send(Direction::AToB, ForeignValue::from(vec![1, 2]), "list")
            .unwrap_err();
        assert!(err.is_unsafe_value());
        assert_eq!(bridge.pending_messages(), 0);
        assert_eq!(bridge.get_stats().messages_to_b, 0);
    }

    #[test]
    fn test_emit_reaches_both_sides() {
        let bridge = bridge();
        let hits = Rc::new(Cell::new(0));
        let a_hits = hits.clone();
        bridge.listen_a("tick", move |_, value| {
            assert!(matches!(value, InterpreterValue::Int(3)));
            a_hits.set(a_hits.get() + 1);
            Ok(())
        });
        let b_hits = hits.clone();
        bridge.listen_b("tick", move |_, value| {
            assert_eq!(*value, EngineValue::Number(3.0));
            b_hits.set(b_hits.get() + 1);
            Ok(())
        });

        let report = bridge.emit("tick", ForeignValue::Number(3.0)).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.delivered, 2);
        assert_eq!(hits.get(), 2);
        assert_eq!(bridge.listener_count("tick"), 2);
        assert_eq!(bridge.get_stats().events_dispatched, 1);
    }

    #[test]
    fn test_emit_without_listeners() {
        let bridge = bridge();
        let report = bridge.emit("nothing", ForeignValue::Null).unwrap();
        assert_eq!(report.listeners(), 0);
        assert_eq!(bridge.get_stats().events_dispatched, 1);
    }
}
