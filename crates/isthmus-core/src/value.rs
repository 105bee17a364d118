//! Runtime-neutral value classification.
//!
//! Every value crossing the bridge is first classified into a [`Kind`] and,
//! when it is converted, lifted into a [`ForeignValue`]. Neither type knows
//! anything about either runtime's native representation.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::id::{Capabilities, HandleId, HostRef, ObjectId, ScopeId, Side};

/// Classification tag assigned to a value independent of its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Kind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Mapping,
    Callable,
    Opaque,
    Error,
    /// A value the runtime itself cannot classify (symbols, raw buffers).
    Unknown,
}

impl Kind {
    /// Array, Mapping and Opaque values carry structure of their own.
    pub fn is_composite(self) -> bool {
        matches!(self, Kind::Array | Kind::Mapping | Kind::Opaque)
    }

    pub fn is_primitive(self) -> bool {
        matches!(self, Kind::Null | Kind::Boolean | Kind::Number | Kind::String)
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Boolean => "boolean",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Array => "array",
            Kind::Mapping => "mapping",
            Kind::Callable => "callable",
            Kind::Opaque => "opaque",
            Kind::Error => "error",
            Kind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric payload as a runtime reports it.
///
/// The interpreter distinguishes integers from floats; the engine only has
/// doubles. Integers are exact across the bridge only within `±2^53`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeNumber {
    Int(i64),
    Float(f64),
}

/// String payload in the runtime's own encoding.
///
/// Either side may hold data that is not valid Unicode (invalid UTF-8 bytes,
/// lone UTF-16 surrogates); the bridge rejects it instead of replacing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeStr {
    Utf8(Vec<u8>),
    Utf16(Vec<u16>),
}

/// Shared flag recording whether an owning scope is still alive.
///
/// Every wrapper holds a clone; tearing the scope down flips it once and all
/// outstanding wrappers observe the change.
#[derive(Debug, Clone)]
pub struct Liveness(Rc<Cell<bool>>);

impl Liveness {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.get()
    }

    pub fn revoke(&self) {
        self.0.set(false);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to an object owned by one runtime, usable from the other.
///
/// A handle never owns its object. The count token that keeps the object
/// reachable lives in the identity cache entry that produced the handle, and
/// that entry never outlives the owning scope.
pub struct WrapperHandle {
    id: HandleId,
    side: Side,
    object: ObjectId,
    scope: ScopeId,
    capabilities: Capabilities,
    liveness: Liveness,
}

/// Shared wrapper reference; identity is pointer identity.
pub type WrapperRef = Rc<WrapperHandle>;

impl WrapperHandle {
    pub fn new(
        id: HandleId,
        side: Side,
        object: ObjectId,
        scope: ScopeId,
        capabilities: Capabilities,
        liveness: Liveness,
    ) -> Self {
        Self {
            id,
            side,
            object,
            scope,
            capabilities,
            liveness,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Runtime that owns the wrapped object.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Raw identity of the wrapped object. Non-owning.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// False once the owning scope has been torn down.
    pub fn is_live(&self) -> bool {
        self.liveness.is_live()
    }

    /// Token to embed in a host object on the other side.
    pub fn host_ref(&self) -> HostRef {
        HostRef {
            scope: self.scope,
            handle: self.id,
            capabilities: self.capabilities,
        }
    }
}

impl fmt::Debug for WrapperHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WrapperHandle({} {}:{} in {} [{}]{})",
            self.id,
            self.side,
            self.object,
            self.scope,
            self.capabilities,
            if self.is_live() { "" } else { " dead" }
        )
    }
}

/// A value classified independent of either runtime's representation.
///
/// Data (null, booleans, numbers, strings, arrays, mappings, errors) is held
/// by value. Callables and opaque objects are never copied: they are held as
/// wrappers around the original object.
#[derive(Debug, Clone)]
pub enum ForeignValue {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Vec<ForeignValue>),
    Mapping(IndexMap<String, ForeignValue>),
    Callable(WrapperRef),
    Opaque(WrapperRef),
    Error(String),
}

impl ForeignValue {
    pub fn kind(&self) -> Kind {
        match self {
            ForeignValue::Null => Kind::Null,
            ForeignValue::Boolean(_) => Kind::Boolean,
            ForeignValue::Number(_) => Kind::Number,
            ForeignValue::String(_) => Kind::String,
            ForeignValue::Array(_) => Kind::Array,
            ForeignValue::Mapping(_) => Kind::Mapping,
            ForeignValue::Callable(_) => Kind::Callable,
            ForeignValue::Opaque(_) => Kind::Opaque,
            ForeignValue::Error(_) => Kind::Error,
        }
    }

    /// Nesting depth: 0 for leaves, 1 + deepest child for arrays and mappings.
    pub fn depth(&self) -> usize {
        match self {
            ForeignValue::Array(items) => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            ForeignValue::Mapping(entries) => {
                1 + entries.values().map(Self::depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ForeignValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ForeignValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ForeignValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ForeignValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ForeignValue]> {
        match self {
            ForeignValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&IndexMap<String, ForeignValue>> {
        match self {
            ForeignValue::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    /// Wrapper carried by a Callable or Opaque value.
    pub fn as_wrapper(&self) -> Option<&WrapperRef> {
        match self {
            ForeignValue::Callable(handle) | ForeignValue::Opaque(handle) => Some(handle),
            _ => None,
        }
    }

    /// Render as JSON. Wrappers become `{"$wrapper": id, "side": "A"|"B"}`,
    /// errors become `{"$error": message}`, non-finite numbers become null.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            ForeignValue::Null => Json::Null,
            ForeignValue::Boolean(b) => Json::Bool(*b),
            ForeignValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            ForeignValue::String(s) => Json::String(s.clone()),
            ForeignValue::Array(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            ForeignValue::Mapping(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            ForeignValue::Callable(handle) | ForeignValue::Opaque(handle) => serde_json::json!({
                "$wrapper": handle.id().as_raw(),
                "side": handle.side().label(),
            }),
            ForeignValue::Error(message) => serde_json::json!({ "$error": message }),
        }
    }

    /// Build a data-only value from JSON. Objects always become mappings.
    pub fn from_json(json: &serde_json::Value) -> ForeignValue {
        use serde_json::Value as Json;
        match json {
            Json::Null => ForeignValue::Null,
            Json::Bool(b) => ForeignValue::Boolean(*b),
            Json::Number(n) => ForeignValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => ForeignValue::String(s.clone()),
            Json::Array(items) => ForeignValue::Array(items.iter().map(Self::from_json).collect()),
            Json::Object(entries) => ForeignValue::Mapping(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for ForeignValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ForeignValue::Null, ForeignValue::Null) => true,
            (ForeignValue::Boolean(a), ForeignValue::Boolean(b)) => a == b,
            (ForeignValue::Number(a), ForeignValue::Number(b)) => a == b,
            (ForeignValue::String(a), ForeignValue::String(b)) => a == b,
            (ForeignValue::Array(a), ForeignValue::Array(b)) => a == b,
            (ForeignValue::Mapping(a), ForeignValue::Mapping(b)) => a == b,
            (ForeignValue::Callable(a), ForeignValue::Callable(b))
            | (ForeignValue::Opaque(a), ForeignValue::Opaque(b)) => Rc::ptr_eq(a, b),
            (ForeignValue::Error(a), ForeignValue::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for ForeignValue {
    fn from(value: bool) -> Self {
        ForeignValue::Boolean(value)
    }
}

impl From<f64> for ForeignValue {
    fn from(value: f64) -> Self {
        ForeignValue::Number(value)
    }
}

impl From<i32> for ForeignValue {
    fn from(value: i32) -> Self {
        ForeignValue::Number(value as f64)
    }
}

impl From<&str> for ForeignValue {
    fn from(value: &str) -> Self {
        ForeignValue::String(value.to_string())
    }
}

impl From<String> for ForeignValue {
    fn from(value: String) -> Self {
        ForeignValue::String(value)
    }
}

impl<T: Into<ForeignValue>> From<Vec<T>> for ForeignValue {
    fn from(items: Vec<T>) -> Self {
        ForeignValue::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(id: u64) -> WrapperRef {
        Rc::new(WrapperHandle::new(
            HandleId::from_raw(id),
            Side::Engine,
            ObjectId::from_raw(id * 16),
            ScopeId::from_raw(1),
            Capabilities::READ,
            Liveness::new(),
        ))
    }

    #[test]
    fn test_depth() {
        assert_eq!(ForeignValue::Number(1.0).depth(), 0);
        assert_eq!(ForeignValue::Array(vec![]).depth(), 1);
        let nested = ForeignValue::from_json(&json!({"a": {"b": [1, 2]}}));
        assert_eq!(nested.depth(), 3);
    }

    #[test]
    fn test_json_shape() {
        let value = ForeignValue::from_json(&json!({"a": 1, "b": [true, "x"], "c": null}));
        assert_eq!(value.kind(), Kind::Mapping);
        assert_eq!(value.to_json(), json!({"a": 1.0, "b": [true, "x"], "c": null}));
    }

    #[test]
    fn test_wrapper_equality_is_identity() {
        let a = handle(1);
        let b = handle(1);
        assert_eq!(ForeignValue::Opaque(a.clone()), ForeignValue::Opaque(a.clone()));
        assert_ne!(ForeignValue::Opaque(a), ForeignValue::Opaque(b));
    }

    #[test]
    fn test_liveness_revocation_is_shared() {
        let liveness = Liveness::new();
        let wrapper = WrapperHandle::new(
            HandleId::from_raw(7),
            Side::Interpreter,
            ObjectId::from_raw(3),
            ScopeId::from_raw(2),
            Capabilities::ALL,
            liveness.clone(),
        );
        assert!(wrapper.is_live());
        liveness.revoke();
        assert!(!wrapper.is_live());
        assert_eq!(wrapper.host_ref().handle, HandleId::from_raw(7));
    }

    #[test]
    fn test_non_finite_number_renders_null() {
        assert_eq!(ForeignValue::Number(f64::NAN).to_json(), serde_json::Value::Null);
    }
}
