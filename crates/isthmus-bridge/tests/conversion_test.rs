//! Integration tests for value conversion and the safety gate

use std::rc::Rc;

use isthmus_bridge::{BridgeError, BridgeRuntime, ConversionFailure, GateReason, Scope};
use isthmus_core::{BridgeConfig, Direction, ForeignValue, GatePolicy, Kind, Runtime, Side};
use isthmus_heap::{Engine, EngineValue, Interpreter, InterpreterValue};

fn scope_with(config: BridgeConfig) -> Scope<Interpreter, Engine> {
    let runtime = BridgeRuntime::initialized();
    Scope::open(
        &runtime,
        Rc::new(Interpreter::new()),
        Rc::new(Engine::new()),
        config,
    )
    .unwrap()
}

fn scope() -> Scope<Interpreter, Engine> {
    scope_with(BridgeConfig::default())
}

fn nested_dict(interp: &Interpreter, levels: usize) -> InterpreterValue {
    (0..levels).fold(InterpreterValue::Int(0), |inner, _| {
        interp.dict(vec![(InterpreterValue::str("next"), inner)])
    })
}

#[test]
fn test_primitives_to_engine() {
    let scope = scope();
    assert_eq!(scope.to_b(&InterpreterValue::None).unwrap(), EngineValue::Null);
    assert_eq!(
        scope.to_b(&InterpreterValue::Bool(true)).unwrap(),
        EngineValue::Bool(true)
    );
    assert_eq!(
        scope.to_b(&InterpreterValue::Int(42)).unwrap(),
        EngineValue::Number(42.0)
    );
    assert_eq!(
        scope.to_b(&InterpreterValue::Float(1.5)).unwrap(),
        EngineValue::Number(1.5)
    );
    assert_eq!(
        scope.to_b(&InterpreterValue::str("héllo")).unwrap(),
        EngineValue::string("héllo")
    );
}

#[test]
fn test_primitives_to_interpreter() {
    let scope = scope();
    assert_eq!(scope.to_a(&EngineValue::Undefined).unwrap(), InterpreterValue::None);
    assert_eq!(
        scope.to_a(&EngineValue::Number(3.0)).unwrap(),
        InterpreterValue::Int(3)
    );
    assert_eq!(
        scope.to_a(&EngineValue::Number(0.25)).unwrap(),
        InterpreterValue::Float(0.25)
    );
    assert_eq!(
        scope.to_a(&EngineValue::string("text")).unwrap(),
        InterpreterValue::str("text")
    );
}

#[test]
fn test_round_trip_preserves_structure() {
    let scope = scope();
    let interp = scope.interpreter().clone();

    let inner = interp.list(vec![InterpreterValue::Bool(true), InterpreterValue::str("x")]);
    let original = interp.dict(vec![
        (InterpreterValue::str("a"), InterpreterValue::Int(1)),
        (InterpreterValue::str("b"), inner),
    ]);

    let in_engine = scope.to_b(&original).unwrap();
    let engine = scope.engine();
    let b = engine.get_property(in_engine.as_object().unwrap(), "b").unwrap();
    assert_eq!(
        engine.get_property(b.as_object().unwrap(), "length").unwrap(),
        EngineValue::Number(2.0)
    );

    let back = scope.to_a(&in_engine).unwrap();
    assert_ne!(back, original);
    assert!(interp.equals(&original, &back));

    interp.discard(back);
    interp.discard(original);
    assert_eq!(interp.live_objects(), 1);
}

#[test]
fn test_mapping_keeps_insertion_order() {
    let scope = scope();
    let engine = scope.engine();
    let object = engine.object(vec![
        ("zeta", EngineValue::Number(1.0)),
        ("alpha", EngineValue::Number(2.0)),
        ("mid", EngineValue::Number(3.0)),
    ]);
    let imported = scope.import_b(&object).unwrap();
    let keys: Vec<_> = imported.as_mapping().unwrap().keys().cloned().collect();
    assert_eq!(keys, ["zeta", "alpha", "mid"]);
}

#[test]
fn test_failing_element_aborts_whole_array() {
    let scope = scope();
    let interp = scope.interpreter().clone();
    let engine_objects = scope.engine().live_objects();

    let list = interp.list(vec![
        InterpreterValue::Int(1),
        InterpreterValue::Int(2),
        InterpreterValue::Bytes(Rc::from(&b"raw"[..])),
        InterpreterValue::Int(4),
        InterpreterValue::Int(5),
    ]);

    let err = scope.to_b(&list).unwrap_err();
    assert_eq!(
        err,
        BridgeError::Conversion {
            path: "$[2]".to_string(),
            failure: ConversionFailure::NoMapping(Kind::Unknown),
        }
    );
    assert_eq!(scope.engine().live_objects(), engine_objects);

    let stats = scope.stats();
    assert_eq!(stats.conversion_errors, 1);
    assert_eq!(stats.conversions_to_b, 0);
}

#[test]
fn test_nested_failure_reports_path() {
    let scope = scope();
    let engine = scope.engine().clone();
    let items = engine.array(vec![EngineValue::Number(1.0), EngineValue::Symbol(7)]);
    let object = engine.object(vec![("items", items)]);

    let err = scope.to_a(&object).unwrap_err();
    match err {
        BridgeError::Conversion { path, failure } => {
            assert_eq!(path, "$.items[1]");
            assert_eq!(failure, ConversionFailure::NoMapping(Kind::Unknown));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(scope.interpreter().live_objects(), 1);
}

#[test]
fn test_conversion_depth_limit() {
    let scope = scope_with(
        BridgeConfig::default()
            .gate(GatePolicy::default().max_depth(64))
            .max_conversion_depth(5),
    );
    let interp = scope.interpreter().clone();

    let shallow = nested_dict(&interp, 5);
    assert!(scope.to_b(&shallow).is_ok());

    let deep = nested_dict(&interp, 10);
    let err = scope.to_b(&deep).unwrap_err();
    assert!(err.is_conversion());
    assert!(matches!(
        err,
        BridgeError::Conversion {
            failure: ConversionFailure::DepthExceeded { limit: 5 },
            ..
        }
    ));
}

#[test]
fn test_gate_depth_rejects_before_conversion() {
    let scope = scope_with(BridgeConfig::default().gate(GatePolicy::default().max_depth(3)));
    let interp = scope.interpreter().clone();
    let err = scope.to_b(&nested_dict(&interp, 4)).unwrap_err();
    assert_eq!(
        err,
        BridgeError::UnsafeValue {
            direction: Direction::AToB,
            reason: GateReason::TooDeep { limit: 3 },
        }
    );
}

#[test]
fn test_cyclic_engine_object_terminates() {
    let scope = scope();
    let engine = scope.engine().clone();
    let node = engine.object(vec![("name", EngineValue::string("node"))]);
    let object = node.as_object().unwrap();
    engine.set_property(object, "self", node.clone()).unwrap();
    let live = engine.live_objects();

    let err = scope.to_a(&node).unwrap_err();
    assert_eq!(
        err,
        BridgeError::UnsafeValue {
            direction: Direction::BToA,
            reason: GateReason::TooDeep { limit: 16 },
        }
    );
    assert_eq!(engine.root_count(object), 0);
    assert_eq!(engine.live_objects(), live);
    assert_eq!(scope.cached_wrappers(Side::Engine), 0);

    let stats = scope.stats();
    assert_eq!(stats.gate_rejections, 1);
    assert_eq!(stats.conversion_errors, 0);
}

#[test]
fn test_cyclic_interpreter_list_terminates() {
    let scope = scope_with(BridgeConfig::default().gate(GatePolicy::default().max_depth(64)));
    let interp = scope.interpreter().clone();
    let list = interp.list(vec![InterpreterValue::Int(1)]);
    let object = list.as_object().unwrap();
    interp.set_property(object, "1", list.clone()).unwrap();
    assert_eq!(interp.refcount(object), 2);
    let live = interp.live_objects();
    let engine_live = scope.engine().live_objects();

    let err = scope.to_b(&list).unwrap_err();
    assert_eq!(
        err,
        BridgeError::UnsafeValue {
            direction: Direction::AToB,
            reason: GateReason::TooDeep { limit: 64 },
        }
    );
    assert_eq!(interp.refcount(object), 2);
    assert_eq!(interp.live_objects(), live);
    assert_eq!(scope.engine().live_objects(), engine_live);

    let err = scope.import_a(&list).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::UnsafeValue {
            reason: GateReason::TooDeep { .. },
            ..
        }
    ));
    assert_eq!(interp.refcount(object), 2);
    assert_eq!(scope.stats().gate_rejections, 2);
}

#[test]
fn test_gate_runs_before_conversion() {
    let scope = scope();
    let interp = scope.interpreter().clone();
    let function = interp.function("handler", |_, _| Ok(InterpreterValue::None));

    let err = scope.to_b(&function).unwrap_err();
    assert_eq!(
        err,
        BridgeError::UnsafeValue {
            direction: Direction::AToB,
            reason: GateReason::CallableBlocked,
        }
    );
    assert_eq!(scope.cached_wrappers(Side::Interpreter), 0);

    let stats = scope.stats();
    assert_eq!(stats.conversion_errors, 0);
    assert_eq!(stats.gate_rejections, 1);
    assert_eq!(stats.serialization_errors, 1);
}

#[test]
fn test_blocked_composite_hides_bad_element() {
    let scope = scope_with(BridgeConfig::default().gate(GatePolicy::primitives_only()));
    let interp = scope.interpreter().clone();
    let list = interp.list(vec![InterpreterValue::Bytes(Rc::from(&b"x"[..]))]);

    let err = scope.to_b(&list).unwrap_err();
    assert!(err.is_unsafe_value());
    assert!(!err.is_conversion());
}

#[test]
fn test_invalid_utf8_rejected() {
    let scope = scope();
    let broken = InterpreterValue::Str(Rc::from(&[0x66, 0xff, 0xfe][..]));
    assert_eq!(
        scope.to_b(&broken).unwrap_err(),
        BridgeError::Conversion {
            path: "$".to_string(),
            failure: ConversionFailure::InvalidEncoding {
                side: Side::Interpreter,
                encoding: "UTF-8",
            },
        }
    );
}

#[test]
fn test_lone_surrogate_rejected() {
    let scope = scope();
    let broken = EngineValue::Str(Rc::from(vec![0x0061, 0xD800]));
    let err = scope.to_a(&broken).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Conversion {
            failure: ConversionFailure::InvalidEncoding {
                side: Side::Engine,
                encoding: "UTF-16",
            },
            ..
        }
    ));
}

#[test]
fn test_integer_beyond_double_precision() {
    let scope = scope();
    let exact = 1_i64 << 53;
    assert_eq!(
        scope.to_b(&InterpreterValue::Int(exact)).unwrap(),
        EngineValue::Number(exact as f64)
    );
    assert_eq!(
        scope.to_b(&InterpreterValue::Int(exact + 1)).unwrap_err(),
        BridgeError::Conversion {
            path: "$".to_string(),
            failure: ConversionFailure::LossyInteger(exact + 1),
        }
    );
}

#[test]
fn test_non_string_keys_dropped() {
    let scope = scope();
    let interp = scope.interpreter().clone();
    let dict = interp.dict(vec![
        (InterpreterValue::Int(1), InterpreterValue::str("one")),
        (InterpreterValue::str("name"), InterpreterValue::str("bridge")),
    ]);

    let imported = scope.import_a(&dict).unwrap();
    let mapping = imported.as_mapping().unwrap();
    assert_eq!(mapping.len(), 1);
    assert_eq!(mapping["name"], ForeignValue::from("bridge"));
    let stats = scope.stats();
    assert_eq!(stats.dropped_keys, 1);
    assert_eq!(stats.conversion_errors, 0);
    assert_eq!(stats.serialization_errors, 1);
}

#[test]
fn test_errors_cross_as_values() {
    let scope = scope();
    let interp = scope.interpreter().clone();
    let exception = interp.exception("ValueError", "bad input");

    let converted = scope.to_b(&exception).unwrap();
    let engine = scope.engine();
    let object = converted.as_object().unwrap();
    assert_eq!(
        engine.get_property(object, "message").unwrap(),
        EngineValue::string("ValueError: bad input")
    );
    assert_eq!(engine.class_of(object).as_deref(), Some("Error"));
}

#[test]
fn test_export_from_json() {
    let scope = scope();
    let json = serde_json::json!({"ok": true, "values": [1, 2.5, "three", null]});
    let value = ForeignValue::from_json(&json);

    let native = scope.export_to_a(&value).unwrap();
    let back = scope.import_a(&native).unwrap();
    assert_eq!(back, value);
    assert_eq!(back.as_mapping().unwrap()["ok"], ForeignValue::Boolean(true));
    scope.interpreter().discard(native);
}

#[test]
fn test_latency_recorded() {
    let scope = scope();
    for n in 0..10 {
        scope.to_b(&InterpreterValue::Int(n)).unwrap();
    }
    scope.to_a(&EngineValue::Bool(false)).unwrap();

    let stats = scope.stats();
    assert_eq!(stats.conversions_to_b, 10);
    assert_eq!(stats.conversions_to_a, 1);
    assert_eq!(stats.total_conversions(), 11);
    assert!(stats.avg_conversion_ms_to_b >= 0.0);
}
