//! Side B: a garbage-collected script engine heap.
//!
//! Objects carry no counts. They survive a [`Engine::collect`] pass only if
//! they are reachable from the global object or from a root added through
//! [`ObjectRetainer::retain`]. Anything else is swept and later access
//! reports [`RuntimeError::Collected`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use isthmus_core::{
    HostDispatch, HostRef, Kind, NativeNumber, NativeStr, ObjectId, ObjectRetainer, Runtime,
    RuntimeError, RuntimeResult, ScopeId, Side,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Native function callable from engine script.
pub type EngineFunction = Rc<dyn Fn(&Engine, &[EngineValue]) -> RuntimeResult<EngineValue>>;

/// Engine value. Strings are UTF-16 code units and may contain lone
/// surrogates.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<[u16]>),
    Symbol(u32),
    Object(ObjectId),
}

impl EngineValue {
    pub fn string(text: &str) -> Self {
        let units: Vec<u16> = text.encode_utf16().collect();
        EngineValue::Str(Rc::from(units))
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            EngineValue::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// Decoded text; `None` for non-strings and ill-formed UTF-16.
    pub fn to_rust_string(&self) -> Option<String> {
        match self {
            EngineValue::Str(units) => String::from_utf16(units).ok(),
            _ => None,
        }
    }
}

enum Body {
    Plain(IndexMap<String, EngineValue>),
    Array(Vec<EngineValue>),
    Function {
        name: String,
        code: EngineFunction,
        props: IndexMap<String, EngineValue>,
    },
    Error {
        name: String,
        message: String,
    },
    /// Platform object with internal state (documents, elements, regexps).
    Exotic {
        class: String,
        props: IndexMap<String, EngineValue>,
    },
    Host(HostRef),
}

impl Body {
    fn kind(&self) -> Kind {
        match self {
            Body::Plain(_) => Kind::Mapping,
            Body::Array(_) => Kind::Array,
            Body::Function { .. } => Kind::Callable,
            Body::Error { .. } => Kind::Error,
            Body::Exotic { .. } => Kind::Opaque,
            Body::Host(host) if host.capabilities.callable => Kind::Callable,
            Body::Host(_) => Kind::Opaque,
        }
    }

    fn props(&self) -> Option<&IndexMap<String, EngineValue>> {
        match self {
            Body::Plain(props) | Body::Function { props, .. } | Body::Exotic { props, .. } => {
                Some(props)
            }
            _ => None,
        }
    }

    fn children(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let from_props = self.props().into_iter().flat_map(|props| props.values());
        let from_items: &[EngineValue] = match self {
            Body::Array(items) => items.as_slice(),
            _ => &[],
        };
        from_props
            .chain(from_items.iter())
            .filter_map(EngineValue::as_object)
    }
}

enum Access<T> {
    Local(T),
    Host(HostRef),
}

/// Garbage-collected script engine.
pub struct Engine {
    heap: RefCell<FxHashMap<ObjectId, Body>>,
    roots: RefCell<FxHashMap<ObjectId, usize>>,
    next_id: Cell<u64>,
    global: ObjectId,
    hosts: RefCell<FxHashMap<ScopeId, Weak<dyn HostDispatch<EngineValue>>>>,
    collections: Cell<u64>,
}

impl Engine {
    pub fn new() -> Self {
        let global = ObjectId::from_raw(1);
        let mut heap = FxHashMap::default();
        heap.insert(
            global,
            Body::Exotic {
                class: "Window".to_string(),
                props: IndexMap::new(),
            },
        );
        Self {
            heap: RefCell::new(heap),
            roots: RefCell::new(FxHashMap::default()),
            next_id: Cell::new(2),
            global,
            hosts: RefCell::new(FxHashMap::default()),
            collections: Cell::new(0),
        }
    }

    fn alloc(&self, body: Body) -> EngineValue {
        let id = ObjectId::from_raw(self.next_id.get());
        self.next_id.set(id.as_raw() + 1);
        self.heap.borrow_mut().insert(id, body);
        EngineValue::Object(id)
    }

    // ---------------------------------------------------------------------
    // Allocation helpers
    // ---------------------------------------------------------------------

    pub fn object(&self, props: Vec<(&str, EngineValue)>) -> EngineValue {
        self.alloc(Body::Plain(
            props
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        ))
    }

    pub fn array(&self, items: Vec<EngineValue>) -> EngineValue {
        self.alloc(Body::Array(items))
    }

    pub fn function<F>(&self, name: &str, code: F) -> EngineValue
    where
        F: Fn(&Engine, &[EngineValue]) -> RuntimeResult<EngineValue> + 'static,
    {
        self.alloc(Body::Function {
            name: name.to_string(),
            code: Rc::new(code),
            props: IndexMap::new(),
        })
    }

    pub fn error(&self, name: &str, message: &str) -> EngineValue {
        self.alloc(Body::Error {
            name: name.to_string(),
            message: message.to_string(),
        })
    }

    /// Platform object of the given class, e.g. `Document`.
    pub fn exotic(&self, class: &str, props: Vec<(&str, EngineValue)>) -> EngineValue {
        self.alloc(Body::Exotic {
            class: class.to_string(),
            props: props
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        })
    }

    pub fn set_global(&self, name: &str, value: EngineValue) -> RuntimeResult<()> {
        self.set_property(self.global, name, value)
    }

    pub fn get_global(&self, name: &str) -> RuntimeResult<EngineValue> {
        self.get_property(self.global, name)
    }

    pub fn class_of(&self, object: ObjectId) -> Option<String> {
        let heap = self.heap.borrow();
        Some(match heap.get(&object)? {
            Body::Plain(_) => "Object".to_string(),
            Body::Array(_) => "Array".to_string(),
            Body::Function { .. } => "Function".to_string(),
            Body::Error { name, .. } => name.clone(),
            Body::Exotic { class, .. } => class.clone(),
            Body::Host(_) => "ForeignObject".to_string(),
        })
    }

    // ---------------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------------

    /// Mark from the global object and all roots, then sweep. Returns the
    /// number of objects reclaimed.
    pub fn collect(&self) -> usize {
        let mut marked = FxHashSet::default();
        let mut stack = vec![self.global];
        stack.extend(self.roots.borrow().keys().copied());

        {
            let heap = self.heap.borrow();
            while let Some(id) = stack.pop() {
                if !marked.insert(id) {
                    continue;
                }
                if let Some(body) = heap.get(&id) {
                    stack.extend(body.children());
                }
            }
        }

        let swept: Vec<Body> = {
            let mut heap = self.heap.borrow_mut();
            let dead: Vec<ObjectId> = heap
                .keys()
                .filter(|id| !marked.contains(*id))
                .copied()
                .collect();
            dead.iter().filter_map(|id| heap.remove(id)).collect()
        };
        self.collections.set(self.collections.get() + 1);

        #[cfg(feature = "heap_logging")]
        tracing::debug!(
            target: "isthmus::heap",
            reclaimed = swept.len(),
            live = marked.len(),
            roots = self.roots.borrow().len(),
            "engine collection finished"
        );

        swept.len()
    }

    pub fn collection_count(&self) -> u64 {
        self.collections.get()
    }

    /// Number of outstanding roots on `object`.
    pub fn root_count(&self, object: ObjectId) -> usize {
        self.roots.borrow().get(&object).copied().unwrap_or(0)
    }

    pub fn is_alive(&self, object: ObjectId) -> bool {
        self.heap.borrow().contains_key(&object)
    }

    pub fn live_objects(&self) -> usize {
        self.heap.borrow().len()
    }

    fn with_body<T>(&self, object: ObjectId, f: impl FnOnce(&Body) -> T) -> RuntimeResult<T> {
        let heap = self.heap.borrow();
        let body = heap.get(&object).ok_or(RuntimeError::Collected(object))?;
        Ok(f(body))
    }

    fn dispatch(&self, host: HostRef) -> RuntimeResult<Rc<dyn HostDispatch<EngineValue>>> {
        self.hosts
            .borrow()
            .get(&host.scope)
            .and_then(Weak::upgrade)
            .ok_or(RuntimeError::Revoked(host.scope))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRetainer for Engine {
    fn retain(&self, object: ObjectId) -> RuntimeResult<()> {
        if !self.is_alive(object) {
            return Err(RuntimeError::Collected(object));
        }
        *self.roots.borrow_mut().entry(object).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, object: ObjectId) {
        let mut roots = self.roots.borrow_mut();
        if let Some(count) = roots.get_mut(&object) {
            *count -= 1;
            if *count == 0 {
                roots.remove(&object);
            }
        }
    }
}

impl Runtime for Engine {
    type Value = EngineValue;

    const SIDE: Side = Side::Engine;

    fn kind_of(&self, value: &EngineValue) -> Kind {
        match value {
            EngineValue::Undefined | EngineValue::Null => Kind::Null,
            EngineValue::Bool(_) => Kind::Boolean,
            EngineValue::Number(_) => Kind::Number,
            EngineValue::Str(_) => Kind::String,
            EngineValue::Symbol(_) => Kind::Unknown,
            EngineValue::Object(id) => self.with_body(*id, Body::kind).unwrap_or(Kind::Unknown),
        }
    }

    fn boolean_of(&self, value: &EngineValue) -> Option<bool> {
        match value {
            EngineValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn number_of(&self, value: &EngineValue) -> Option<NativeNumber> {
        match value {
            EngineValue::Number(n) => Some(NativeNumber::Float(*n)),
            _ => None,
        }
    }

    fn string_of(&self, value: &EngineValue) -> Option<NativeStr> {
        match value {
            EngineValue::Str(units) => Some(NativeStr::Utf16(units.to_vec())),
            _ => None,
        }
    }

    fn elements_of(&self, value: &EngineValue) -> RuntimeResult<Vec<EngineValue>> {
        let id = value
            .as_object()
            .ok_or_else(|| RuntimeError::type_error("not an array"))?;
        self.with_body(id, |body| match body {
            Body::Array(items) => Ok(items.clone()),
            _ => Err(RuntimeError::type_error("not an array")),
        })?
    }

    fn entries_of(&self, value: &EngineValue) -> RuntimeResult<Vec<(EngineValue, EngineValue)>> {
        let id = value
            .as_object()
            .ok_or_else(|| RuntimeError::type_error("not an object"))?;
        self.with_body(id, |body| match body {
            Body::Plain(props) => Ok(props
                .iter()
                .map(|(key, value)| (EngineValue::string(key), value.clone()))
                .collect()),
            _ => Err(RuntimeError::type_error("not a plain object")),
        })?
    }

    fn error_message_of(&self, value: &EngineValue) -> Option<String> {
        let id = value.as_object()?;
        self.with_body(id, |body| match body {
            Body::Error { name, message } => Some(format!("{}: {}", name, message)),
            _ => None,
        })
        .ok()
        .flatten()
    }

    fn object_id_of(&self, value: &EngineValue) -> Option<ObjectId> {
        value.as_object()
    }

    fn host_ref_of(&self, value: &EngineValue) -> Option<HostRef> {
        let id = value.as_object()?;
        self.with_body(id, |body| match body {
            Body::Host(host) => Some(*host),
            _ => None,
        })
        .ok()
        .flatten()
    }

    fn value_of_object(&self, object: ObjectId) -> RuntimeResult<EngineValue> {
        self.with_body(object, |_| EngineValue::Object(object))
    }

    fn discard(&self, _value: EngineValue) {}

    fn make_null(&self) -> EngineValue {
        EngineValue::Null
    }

    fn make_boolean(&self, value: bool) -> EngineValue {
        EngineValue::Bool(value)
    }

    fn make_number(&self, value: f64) -> EngineValue {
        EngineValue::Number(value)
    }

    fn make_string(&self, value: &str) -> RuntimeResult<EngineValue> {
        Ok(EngineValue::string(value))
    }

    fn make_array(&self, items: Vec<EngineValue>) -> RuntimeResult<EngineValue> {
        Ok(self.array(items))
    }

    fn make_mapping(&self, entries: Vec<(String, EngineValue)>) -> RuntimeResult<EngineValue> {
        Ok(self.alloc(Body::Plain(entries.into_iter().collect())))
    }

    fn make_error(&self, message: &str) -> RuntimeResult<EngineValue> {
        Ok(self.error("Error", message))
    }

    fn make_host(&self, host: HostRef) -> RuntimeResult<EngineValue> {
        Ok(self.alloc(Body::Host(host)))
    }

    fn get_property(&self, object: ObjectId, key: &str) -> RuntimeResult<EngineValue> {
        let access = self.with_body(object, |body| {
            if let Body::Host(host) = body {
                return Access::Host(*host);
            }
            if let Some(value) = body.props().and_then(|props| props.get(key)) {
                return Access::Local(Some(value.clone()));
            }
            Access::Local(match body {
                Body::Array(items) if key == "length" => Some(EngineValue::Number(items.len() as f64)),
                Body::Array(items) => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index).cloned()),
                Body::Function { name, .. } if key == "name" => Some(EngineValue::string(name)),
                Body::Error { name, .. } if key == "name" => Some(EngineValue::string(name)),
                Body::Error { message, .. } if key == "message" => {
                    Some(EngineValue::string(message))
                }
                _ => None,
            })
        })?;

        match access {
            Access::Local(Some(value)) => Ok(value),
            Access::Local(None) => Err(RuntimeError::NoSuchProperty(key.to_string())),
            Access::Host(host) => self.dispatch(host)?.get(host, key),
        }
    }

    fn set_property(&self, object: ObjectId, key: &str, value: EngineValue) -> RuntimeResult<()> {
        let host = {
            let mut heap = self.heap.borrow_mut();
            let body = heap
                .get_mut(&object)
                .ok_or(RuntimeError::Collected(object))?;
            match body {
                Body::Host(host) => Some(*host),
                Body::Plain(props) | Body::Function { props, .. } | Body::Exotic { props, .. } => {
                    props.insert(key.to_string(), value.clone());
                    None
                }
                Body::Array(items) => {
                    let index = key.parse::<usize>().map_err(|_| {
                        RuntimeError::type_error(format!("invalid array index '{}'", key))
                    })?;
                    if index >= items.len() {
                        items.resize(index + 1, EngineValue::Undefined);
                    }
                    items[index] = value.clone();
                    None
                }
                Body::Error { .. } => {
                    return Err(RuntimeError::type_error(format!(
                        "cannot set '{}' on an error object",
                        key
                    )));
                }
            }
        };

        match host {
            Some(host) => self.dispatch(host)?.set(host, key, value),
            None => Ok(()),
        }
    }

    fn own_keys(&self, object: ObjectId) -> RuntimeResult<Vec<String>> {
        let access = self.with_body(object, |body| match body {
            Body::Host(host) => Access::Host(*host),
            Body::Array(items) => Access::Local((0..items.len()).map(|i| i.to_string()).collect()),
            Body::Error { .. } => Access::Local(vec!["message".to_string()]),
            other => Access::Local(
                other
                    .props()
                    .map(|props| props.keys().cloned().collect())
                    .unwrap_or_default(),
            ),
        })?;
        match access {
            Access::Local(keys) => Ok(keys),
            Access::Host(host) => self.dispatch(host)?.keys(host),
        }
    }

    fn is_callable(&self, object: ObjectId) -> bool {
        self.with_body(object, |body| body.kind() == Kind::Callable)
            .unwrap_or(false)
    }

    fn call(&self, callee: ObjectId, args: Vec<EngineValue>) -> RuntimeResult<EngineValue> {
        let target = self.with_body(callee, |body| match body {
            Body::Function { code, .. } => Some(Access::Local(code.clone())),
            Body::Host(host) => Some(Access::Host(*host)),
            _ => None,
        })?;
        match target {
            Some(Access::Local(code)) => code(self, &args),
            Some(Access::Host(host)) => self.dispatch(host)?.call(host, args),
            None => Err(RuntimeError::NotCallable(callee)),
        }
    }

    fn global_object(&self) -> ObjectId {
        self.global
    }

    fn attach_host(&self, scope: ScopeId, dispatch: Weak<dyn HostDispatch<EngineValue>>) {
        self.hosts.borrow_mut().insert(scope, dispatch);
    }

    fn detach_host(&self, scope: ScopeId) {
        self.hosts.borrow_mut().remove(&scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_objects_are_swept() {
        let engine = Engine::new();
        let orphan = engine.object(vec![]).as_object().unwrap();
        let kept = engine.object(vec![("n", EngineValue::Number(1.0))]);
        let kept_id = kept.as_object().unwrap();
        engine.set_global("kept", kept).unwrap();

        assert_eq!(engine.collect(), 1);
        assert!(!engine.is_alive(orphan));
        assert!(engine.is_alive(kept_id));
        assert_eq!(
            engine.get_property(orphan, "x"),
            Err(RuntimeError::Collected(orphan))
        );
    }

    #[test]
    fn test_roots_keep_objects_alive() {
        let engine = Engine::new();
        let child = engine.array(vec![]);
        let child_id = child.as_object().unwrap();
        let parent = engine.object(vec![("child", child)]).as_object().unwrap();

        engine.retain(parent).unwrap();
        engine.retain(parent).unwrap();
        assert_eq!(engine.root_count(parent), 2);
        engine.collect();
        assert!(engine.is_alive(child_id));

        engine.release(parent);
        engine.release(parent);
        assert_eq!(engine.root_count(parent), 0);
        engine.collect();
        assert!(!engine.is_alive(parent));
        assert!(!engine.is_alive(child_id));
        assert_eq!(engine.retain(parent), Err(RuntimeError::Collected(parent)));
    }

    #[test]
    fn test_classification() {
        let engine = Engine::new();
        assert_eq!(engine.kind_of(&EngineValue::Undefined), Kind::Null);
        assert_eq!(engine.kind_of(&EngineValue::Symbol(1)), Kind::Unknown);
        assert_eq!(engine.kind_of(&engine.object(vec![])), Kind::Mapping);
        assert_eq!(engine.kind_of(&engine.exotic("Document", vec![])), Kind::Opaque);
        let error = engine.error("TypeError", "bad");
        assert_eq!(engine.kind_of(&error), Kind::Error);
        assert_eq!(
            engine.error_message_of(&error).as_deref(),
            Some("TypeError: bad")
        );
    }

    #[test]
    fn test_array_properties() {
        let engine = Engine::new();
        let array = engine.array(vec![EngineValue::Number(5.0)]);
        let id = array.as_object().unwrap();
        assert_eq!(engine.get_property(id, "length"), Ok(EngineValue::Number(1.0)));
        engine.set_property(id, "2", EngineValue::Bool(true)).unwrap();
        assert_eq!(engine.own_keys(id).unwrap(), vec!["0", "1", "2"]);
        assert_eq!(engine.get_property(id, "1"), Ok(EngineValue::Undefined));
    }

    #[test]
    fn test_lone_surrogate_does_not_decode() {
        let value = EngineValue::Str(Rc::from(vec![0x0061, 0xD800]));
        assert_eq!(value.to_rust_string(), None);
        assert_eq!(EngineValue::string("hé").to_rust_string().as_deref(), Some("hé"));
    }

    #[test]
    fn test_call_and_throw() {
        let engine = Engine::new();
        let thrower = engine.function("fail", |_, _| {
            Err(RuntimeError::thrown("RangeError", "out of range"))
        });
        let id = thrower.as_object().unwrap();
        assert_eq!(
            engine.call(id, vec![]),
            Err(RuntimeError::thrown("RangeError", "out of range"))
        );
        let plain = engine.object(vec![]).as_object().unwrap();
        assert_eq!(engine.call(plain, vec![]), Err(RuntimeError::NotCallable(plain)));
    }
}
