//! Integration tests for wrapper identity, ownership and teardown

use std::rc::Rc;

use isthmus_bridge::{BridgeError, BridgeRuntime, ConversionFailure, HandleFault, Scope, SetupFault};
use isthmus_core::{BridgeConfig, Capabilities, ForeignValue, Kind, Runtime, RuntimeError, Side};
use isthmus_heap::{Engine, EngineValue, Interpreter, InterpreterValue};

fn open(runtime: &Rc<BridgeRuntime>) -> Scope<Interpreter, Engine> {
    Scope::open(
        runtime,
        Rc::new(Interpreter::new()),
        Rc::new(Engine::new()),
        BridgeConfig::default(),
    )
    .unwrap()
}

fn document(engine: &Engine) -> EngineValue {
    let doc = engine.exotic("Document", vec![("title", EngineValue::string("Hello"))]);
    engine.set_global("document", doc.clone()).unwrap();
    doc
}

#[test]
fn test_same_object_same_wrapper() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let doc = document(scope.engine());

    let first = scope.import_b(&doc).unwrap();
    let second = scope.import_b(&doc).unwrap();
    let (ForeignValue::Opaque(a), ForeignValue::Opaque(b)) = (&first, &second) else {
        panic!("document should cross as an opaque wrapper");
    };
    assert!(Rc::ptr_eq(a, b));
    assert_eq!(first, second);
    assert_eq!(scope.cached_wrappers(Side::Engine), 1);
    assert_eq!(a.capabilities(), Capabilities::READ_WRITE);
}

#[test]
fn test_proxy_created_once() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let doc = document(scope.engine());
    let interp = scope.interpreter().clone();

    let first = scope.to_a(&doc).unwrap();
    let second = scope.to_a(&doc).unwrap();
    assert_eq!(first, second);
    assert_eq!(interp.class_of(first.as_object().unwrap()).as_deref(), Some("foreign"));

    interp.discard(first);
    interp.discard(second);
}

#[test]
fn test_wrapper_returns_home_unwrapped() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let doc = document(scope.engine());

    let proxy = scope.to_a(&doc).unwrap();
    let back = scope.to_b(&proxy).unwrap();
    assert_eq!(back, doc);
    scope.interpreter().discard(proxy);
}

#[test]
fn test_interpreter_counts_balanced() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let interp = scope.interpreter().clone();

    let instance = interp.instance("Point", vec![("x", InterpreterValue::Int(1))]);
    let object = instance.as_object().unwrap();
    assert_eq!(interp.refcount(object), 1);

    let handle = scope.wrap_a(&instance).unwrap();
    assert_eq!(interp.refcount(object), 2);
    scope.wrap_a(&instance).unwrap();
    scope.import_a(&instance).unwrap();
    assert_eq!(interp.refcount(object), 2);

    let in_engine = scope.to_b(&instance).unwrap();
    let host = in_engine.as_object().unwrap();
    assert_eq!(scope.engine().root_count(host), 1);

    scope.teardown();
    assert_eq!(interp.refcount(object), 1);
    assert_eq!(scope.engine().root_count(host), 0);
    assert!(!handle.is_live());

    interp.discard(instance);
    assert!(!interp.is_alive(object));
}

#[test]
fn test_wrap_refuses_data_without_importing() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let interp = scope.interpreter().clone();

    let instance = interp.instance("Point", vec![("x", InterpreterValue::Int(1))]);
    let object = instance.as_object().unwrap();
    let list = interp.list(vec![instance]);

    let err = scope.wrap_a(&list).unwrap_err();
    assert_eq!(
        err,
        BridgeError::conversion("$", ConversionFailure::NoMapping(Kind::Array))
    );
    assert_eq!(scope.cached_wrappers(Side::Interpreter), 0);
    assert_eq!(interp.refcount(object), 1);

    interp.discard(list);
    assert!(!interp.is_alive(object));
}

#[test]
fn test_engine_roots_balanced() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let engine = scope.engine().clone();

    let node = engine.exotic("Element", vec![]);
    let object = node.as_object().unwrap();
    let proxy = scope.to_a(&node).unwrap();
    let proxy_object = proxy.as_object().unwrap();
    scope.interpreter().discard(proxy);

    engine.collect();
    assert!(engine.is_alive(object));
    assert_eq!(engine.root_count(object), 1);
    assert_eq!(scope.interpreter().refcount(proxy_object), 1);

    scope.teardown();
    assert_eq!(engine.root_count(object), 0);
    assert!(!scope.interpreter().is_alive(proxy_object));
    engine.collect();
    assert!(!engine.is_alive(object));
}

#[test]
fn test_teardown_invalidates_handles() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let doc = document(scope.engine());
    let handle = scope.wrap_b(&doc).unwrap();
    assert_eq!(scope.get(&handle, "title").unwrap(), ForeignValue::from("Hello"));

    scope.teardown();
    scope.teardown();
    assert!(!scope.is_live());
    assert_eq!(scope.cached_wrappers(Side::Engine), 0);

    assert_eq!(
        scope.get(&handle, "title").unwrap_err(),
        BridgeError::InvalidHandle {
            handle: handle.id(),
            fault: HandleFault::ScopeTornDown,
        }
    );
    assert_eq!(
        scope.to_b(&InterpreterValue::Int(1)).unwrap_err(),
        BridgeError::UninitializedBridge(SetupFault::ScopeClosed(scope.id()))
    );
}

#[test]
fn test_carried_wrapper_from_torn_down_scope() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let doc = document(scope.engine());
    let handle = scope.wrap_b(&doc).unwrap();
    let target = scope.wrap_b(&doc).unwrap();
    scope.teardown();

    let torn_down = BridgeError::InvalidHandle {
        handle: handle.id(),
        fault: HandleFault::ScopeTornDown,
    };
    let opaque = ForeignValue::Opaque(handle.clone());
    assert_eq!(scope.export_to_a(&opaque).unwrap_err(), torn_down);
    assert_eq!(scope.export_to_b(&opaque).unwrap_err(), torn_down);

    let nested = ForeignValue::Array(vec![
        ForeignValue::Number(1.0),
        ForeignValue::Array(vec![opaque.clone()]),
    ]);
    assert_eq!(scope.export_to_a(&nested).unwrap_err(), torn_down);
    assert_eq!(scope.call(&target, &[nested]).unwrap_err(), BridgeError::InvalidHandle {
        handle: target.id(),
        fault: HandleFault::ScopeTornDown,
    });

    // Plain data still reports the closed scope.
    assert_eq!(
        scope.export_to_a(&ForeignValue::Number(1.0)).unwrap_err(),
        BridgeError::UninitializedBridge(SetupFault::ScopeClosed(scope.id()))
    );
}

#[test]
fn test_host_object_revoked_after_teardown() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let doc = document(scope.engine());
    let interp = scope.interpreter().clone();

    let proxy = scope.to_a(&doc).unwrap();
    let object = proxy.as_object().unwrap();
    assert_eq!(
        interp.get_property(object, "title").unwrap(),
        InterpreterValue::str("Hello")
    );

    scope.teardown();
    assert!(interp.is_alive(object));
    assert_eq!(
        interp.get_property(object, "title").unwrap_err(),
        RuntimeError::Revoked(scope.id())
    );
    interp.discard(proxy);
    assert!(!interp.is_alive(object));
}

#[test]
fn test_property_access_through_wrapper() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let engine = scope.engine().clone();
    let doc = document(&engine);
    let handle = scope.wrap_b(&doc).unwrap();

    scope
        .set(&handle, "title", &ForeignValue::from("Renamed"))
        .unwrap();
    assert_eq!(
        engine.get_property(doc.as_object().unwrap(), "title").unwrap(),
        EngineValue::string("Renamed")
    );
    assert_eq!(scope.keys(&handle).unwrap(), vec!["title".to_string()]);

    let err = scope.get(&handle, "missing").unwrap_err();
    assert_eq!(
        err,
        BridgeError::PropertyAccess {
            key: "missing".to_string(),
            source: RuntimeError::NoSuchProperty("missing".to_string()),
        }
    );
}

#[test]
fn test_capability_checked_on_unwrap() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let doc = document(scope.engine());
    let handle = scope.wrap_b(&doc).unwrap();

    assert_eq!(
        scope.unwrap(&handle, Capabilities::READ).unwrap(),
        doc.as_object().unwrap()
    );
    let err = scope.call(&handle, &[]).unwrap_err();
    assert_eq!(
        err,
        BridgeError::InvalidHandle {
            handle: handle.id(),
            fault: HandleFault::CapabilityMismatch {
                required: Capabilities::CALL,
                actual: Capabilities::READ_WRITE,
            },
        }
    );
}

#[test]
fn test_handle_from_other_scope_rejected() {
    let runtime = BridgeRuntime::initialized();
    let interp = Rc::new(Interpreter::new());
    let engine = Rc::new(Engine::new());
    let first: Scope<Interpreter, Engine> = Scope::open(
        &runtime,
        interp.clone(),
        engine.clone(),
        BridgeConfig::default(),
    )
    .unwrap();
    let second: Scope<Interpreter, Engine> =
        Scope::open(&runtime, interp, engine.clone(), BridgeConfig::default()).unwrap();
    assert_eq!(runtime.live_scopes(), 2);

    let doc = document(&engine);
    let handle = first.wrap_b(&doc).unwrap();
    assert_eq!(
        second.get(&handle, "title").unwrap_err(),
        BridgeError::InvalidHandle {
            handle: handle.id(),
            fault: HandleFault::ForeignScope(first.id()),
        }
    );

    drop(first);
    assert_eq!(runtime.live_scopes(), 1);
    assert_eq!(engine.root_count(doc.as_object().unwrap()), 0);
}

#[test]
fn test_uninitialized_runtime_refuses_scopes() {
    let runtime = BridgeRuntime::new();
    let result: Result<Scope<Interpreter, Engine>, _> = Scope::open(
        &runtime,
        Rc::new(Interpreter::new()),
        Rc::new(Engine::new()),
        BridgeConfig::default(),
    );
    assert_eq!(
        result.err(),
        Some(BridgeError::UninitializedBridge(SetupFault::NotInitialized))
    );
}

#[test]
fn test_invalid_config_refused() {
    let runtime = BridgeRuntime::initialized();
    let result: Result<Scope<Interpreter, Engine>, _> = Scope::open(
        &runtime,
        Rc::new(Interpreter::new()),
        Rc::new(Engine::new()),
        BridgeConfig::default().max_call_depth(0),
    );
    assert!(matches!(
        result.err(),
        Some(BridgeError::UninitializedBridge(SetupFault::InvalidConfig(_)))
    ));
}

#[test]
fn test_shutdown_closes_every_scope() {
    let runtime = BridgeRuntime::initialized();
    let scope = open(&runtime);
    let other = open(&runtime);
    let doc = document(scope.engine());
    let handle = scope.wrap_b(&doc).unwrap();

    assert_eq!(runtime.shutdown(), 2);
    assert!(!runtime.is_initialized());
    assert_eq!(runtime.live_scopes(), 0);
    assert!(!scope.is_live() && !other.is_live());
    assert_eq!(scope.engine().root_count(doc.as_object().unwrap()), 0);

    assert_eq!(
        scope.to_b(&InterpreterValue::None).unwrap_err(),
        BridgeError::UninitializedBridge(SetupFault::NotInitialized)
    );
    assert!(scope.get(&handle, "title").unwrap_err().is_invalid_handle());
}
