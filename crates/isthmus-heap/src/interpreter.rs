//! Side A: a reference-counted interpreter heap.
//!
//! Every object starts with a count of one owned by whoever allocated it.
//! Containers own one count on each child. When a count reaches zero the
//! object is removed immediately and its children are released in turn.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use isthmus_core::{
    HostDispatch, HostRef, Kind, NativeNumber, NativeStr, ObjectId, ObjectRetainer, Runtime,
    RuntimeError, RuntimeResult, ScopeId, Side,
};
use rustc_hash::FxHashMap;

/// Native function callable from interpreter code. Arguments are borrowed,
/// the result is a new reference.
pub type InterpreterFunction =
    Rc<dyn Fn(&Interpreter, &[InterpreterValue]) -> RuntimeResult<InterpreterValue>>;

/// Interpreter value. Object variants are non-owning; see the crate docs for
/// which primitives hand out counted references.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpreterValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Text as stored by the interpreter. Not guaranteed to be valid UTF-8.
    Str(Rc<[u8]>),
    /// Raw byte buffer; has no counterpart on the engine side.
    Bytes(Rc<[u8]>),
    Object(ObjectId),
}

impl InterpreterValue {
    pub fn str(text: &str) -> Self {
        InterpreterValue::Str(Rc::from(text.as_bytes()))
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            InterpreterValue::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            InterpreterValue::Str(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

enum Body {
    List(Vec<InterpreterValue>),
    Tuple(Vec<InterpreterValue>),
    /// Insertion-ordered; keys may be any value.
    Dict(Vec<(InterpreterValue, InterpreterValue)>),
    Function {
        name: String,
        code: InterpreterFunction,
    },
    Instance {
        class: String,
        attrs: IndexMap<String, InterpreterValue>,
    },
    Exception {
        class: String,
        message: String,
    },
    Host(HostRef),
}

impl Body {
    fn kind(&self) -> Kind {
        match self {
            Body::List(_) | Body::Tuple(_) => Kind::Array,
            Body::Dict(_) => Kind::Mapping,
            Body::Function { .. } => Kind::Callable,
            Body::Instance { .. } => Kind::Opaque,
            Body::Exception { .. } => Kind::Error,
            Body::Host(host) if host.capabilities.callable => Kind::Callable,
            Body::Host(_) => Kind::Opaque,
        }
    }

    /// Objects this body holds a count on.
    fn children(&self) -> Vec<ObjectId> {
        match self {
            Body::List(items) | Body::Tuple(items) => {
                items.iter().filter_map(InterpreterValue::as_object).collect()
            }
            Body::Dict(entries) => entries
                .iter()
                .flat_map(|(key, value)| [key.as_object(), value.as_object()])
                .flatten()
                .collect(),
            Body::Instance { attrs, .. } => {
                attrs.values().filter_map(InterpreterValue::as_object).collect()
            }
            Body::Function { .. } | Body::Exception { .. } | Body::Host(_) => Vec::new(),
        }
    }
}

struct Slot {
    refcount: usize,
    body: Body,
}

type Objects = FxHashMap<ObjectId, Slot>;

enum Lookup {
    Found(Option<InterpreterValue>),
    Host(HostRef),
}

enum Callee {
    Native(InterpreterFunction),
    Host(HostRef),
}

/// Reference-counted interpreter.
pub struct Interpreter {
    objects: RefCell<Objects>,
    next_id: Cell<u64>,
    globals: ObjectId,
    hosts: RefCell<FxHashMap<ScopeId, Weak<dyn HostDispatch<InterpreterValue>>>>,
}

impl Interpreter {
    pub fn new() -> Self {
        let globals = ObjectId::from_raw(1);
        let mut objects = Objects::default();
        objects.insert(
            globals,
            Slot {
                refcount: 1,
                body: Body::Instance {
                    class: "module".to_string(),
                    attrs: IndexMap::new(),
                },
            },
        );
        Self {
            objects: RefCell::new(objects),
            next_id: Cell::new(2),
            globals,
            hosts: RefCell::new(FxHashMap::default()),
        }
    }

    fn alloc(&self, body: Body) -> ObjectId {
        let id = ObjectId::from_raw(self.next_id.get());
        self.next_id.set(id.as_raw() + 1);
        self.objects
            .borrow_mut()
            .insert(id, Slot { refcount: 1, body });
        id
    }

    // ---------------------------------------------------------------------
    // Reference counting
    // ---------------------------------------------------------------------

    pub fn incref(&self, object: ObjectId) -> RuntimeResult<()> {
        let mut objects = self.objects.borrow_mut();
        let slot = objects.get_mut(&object).ok_or(RuntimeError::Dead(object))?;
        slot.refcount += 1;
        Ok(())
    }

    /// Drop one count; frees the object and releases its children at zero.
    /// Releasing an object that is already gone does nothing.
    pub fn decref(&self, object: ObjectId) {
        let mut pending = vec![object];
        while let Some(id) = pending.pop() {
            let freed = {
                let mut objects = self.objects.borrow_mut();
                let Some(slot) = objects.get_mut(&id) else {
                    continue;
                };
                slot.refcount = slot.refcount.saturating_sub(1);
                if slot.refcount > 0 {
                    continue;
                }
                objects.remove(&id)
            };
            if let Some(slot) = freed {
                #[cfg(feature = "heap_logging")]
                tracing::trace!(target: "isthmus::heap", object = %id, "interpreter object freed");
                pending.extend(slot.body.children());
            }
        }
    }

    /// Current count; 0 once the object has been freed.
    pub fn refcount(&self, object: ObjectId) -> usize {
        self.objects
            .borrow()
            .get(&object)
            .map_or(0, |slot| slot.refcount)
    }

    pub fn is_alive(&self, object: ObjectId) -> bool {
        self.objects.borrow().contains_key(&object)
    }

    pub fn live_objects(&self) -> usize {
        self.objects.borrow().len()
    }

    fn incref_value(&self, value: &InterpreterValue) -> RuntimeResult<()> {
        match value {
            InterpreterValue::Object(id) => self.incref(*id),
            _ => Ok(()),
        }
    }

    fn decref_value(&self, value: &InterpreterValue) {
        if let InterpreterValue::Object(id) = value {
            self.decref(*id);
        }
    }

    // ---------------------------------------------------------------------
    // Allocation helpers
    // ---------------------------------------------------------------------

    /// New list; steals the counts held by `items`.
    pub fn list(&self, items: Vec<InterpreterValue>) -> InterpreterValue {
        InterpreterValue::Object(self.alloc(Body::List(items)))
    }

    pub fn tuple(&self, items: Vec<InterpreterValue>) -> InterpreterValue {
        InterpreterValue::Object(self.alloc(Body::Tuple(items)))
    }

    /// New dict; steals the counts held by keys and values.
    pub fn dict(&self, entries: Vec<(InterpreterValue, InterpreterValue)>) -> InterpreterValue {
        InterpreterValue::Object(self.alloc(Body::Dict(entries)))
    }

    /// New class instance with the given attributes.
    pub fn instance(
        &self,
        class: &str,
        attrs: Vec<(&str, InterpreterValue)>,
    ) -> InterpreterValue {
        let attrs = attrs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        InterpreterValue::Object(self.alloc(Body::Instance {
            class: class.to_string(),
            attrs,
        }))
    }

    pub fn function<F>(&self, name: &str, code: F) -> InterpreterValue
    where
        F: Fn(&Interpreter, &[InterpreterValue]) -> RuntimeResult<InterpreterValue> + 'static,
    {
        InterpreterValue::Object(self.alloc(Body::Function {
            name: name.to_string(),
            code: Rc::new(code),
        }))
    }

    pub fn exception(&self, class: &str, message: &str) -> InterpreterValue {
        InterpreterValue::Object(self.alloc(Body::Exception {
            class: class.to_string(),
            message: message.to_string(),
        }))
    }

    /// Bind a module global; steals the count held by `value`.
    pub fn set_global(&self, name: &str, value: InterpreterValue) -> RuntimeResult<()> {
        self.set_property(self.globals, name, value.clone())?;
        self.decref_value(&value);
        Ok(())
    }

    /// Read a module global as a new reference.
    pub fn get_global(&self, name: &str) -> RuntimeResult<InterpreterValue> {
        self.get_property(self.globals, name)
    }

    /// Class name of an instance or exception.
    pub fn class_of(&self, object: ObjectId) -> Option<String> {
        match &self.objects.borrow().get(&object)?.body {
            Body::Instance { class, .. } | Body::Exception { class, .. } => Some(class.clone()),
            Body::Function { .. } => Some("function".to_string()),
            Body::List(_) => Some("list".to_string()),
            Body::Tuple(_) => Some("tuple".to_string()),
            Body::Dict(_) => Some("dict".to_string()),
            Body::Host(_) => Some("foreign".to_string()),
        }
    }

    /// Structural equality. Numbers compare by value across int and float.
    pub fn equals(&self, a: &InterpreterValue, b: &InterpreterValue) -> bool {
        use InterpreterValue as V;
        match (a, b) {
            (V::Int(x), V::Float(y)) | (V::Float(y), V::Int(x)) => (*x as f64) == *y,
            (V::Object(x), V::Object(y)) if x == y => true,
            (V::Object(x), V::Object(y)) => {
                let (left, right) = {
                    let objects = self.objects.borrow();
                    match (objects.get(x), objects.get(y)) {
                        (Some(l), Some(r)) => (Self::structure(&l.body), Self::structure(&r.body)),
                        _ => return false,
                    }
                };
                match (left, right) {
                    (Some(Shape::Seq(l)), Some(Shape::Seq(r))) => {
                        l.len() == r.len() && l.iter().zip(&r).all(|(p, q)| self.equals(p, q))
                    }
                    (Some(Shape::Map(l)), Some(Shape::Map(r))) => {
                        l.len() == r.len()
                            && l.iter().all(|(key, value)| {
                                r.iter().any(|(other_key, other_value)| {
                                    self.equals(key, other_key) && self.equals(value, other_value)
                                })
                            })
                    }
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    fn structure(body: &Body) -> Option<Shape> {
        match body {
            Body::List(items) | Body::Tuple(items) => Some(Shape::Seq(items.clone())),
            Body::Dict(entries) => Some(Shape::Map(entries.clone())),
            _ => None,
        }
    }

    fn dispatch(&self, host: HostRef) -> RuntimeResult<Rc<dyn HostDispatch<InterpreterValue>>> {
        self.hosts
            .borrow()
            .get(&host.scope)
            .and_then(Weak::upgrade)
            .ok_or(RuntimeError::Revoked(host.scope))
    }

    fn with_body<T>(&self, object: ObjectId, f: impl FnOnce(&Body) -> T) -> RuntimeResult<T> {
        let objects = self.objects.borrow();
        let slot = objects.get(&object).ok_or(RuntimeError::Dead(object))?;
        Ok(f(&slot.body))
    }
}

enum Shape {
    Seq(Vec<InterpreterValue>),
    Map(Vec<(InterpreterValue, InterpreterValue)>),
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRetainer for Interpreter {
    fn retain(&self, object: ObjectId) -> RuntimeResult<()> {
        self.incref(object)
    }

    fn release(&self, object: ObjectId) {
        self.decref(object)
    }
}

impl Runtime for Interpreter {
    type Value = InterpreterValue;

    const SIDE: Side = Side::Interpreter;

    fn kind_of(&self, value: &InterpreterValue) -> Kind {
        match value {
            InterpreterValue::None => Kind::Null,
            InterpreterValue::Bool(_) => Kind::Boolean,
            InterpreterValue::Int(_) | InterpreterValue::Float(_) => Kind::Number,
            InterpreterValue::Str(_) => Kind::String,
            InterpreterValue::Bytes(_) => Kind::Unknown,
            InterpreterValue::Object(id) => self
                .with_body(*id, Body::kind)
                .unwrap_or(Kind::Unknown),
        }
    }

    fn boolean_of(&self, value: &InterpreterValue) -> Option<bool> {
        match value {
            InterpreterValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn number_of(&self, value: &InterpreterValue) -> Option<NativeNumber> {
        match value {
            InterpreterValue::Int(n) => Some(NativeNumber::Int(*n)),
            InterpreterValue::Float(n) => Some(NativeNumber::Float(*n)),
            _ => None,
        }
    }

    fn string_of(&self, value: &InterpreterValue) -> Option<NativeStr> {
        match value {
            InterpreterValue::Str(bytes) => Some(NativeStr::Utf8(bytes.to_vec())),
            _ => None,
        }
    }

    fn elements_of(&self, value: &InterpreterValue) -> RuntimeResult<Vec<InterpreterValue>> {
        let id = value
            .as_object()
            .ok_or_else(|| RuntimeError::type_error("not a sequence"))?;
        self.with_body(id, |body| match body {
            Body::List(items) | Body::Tuple(items) => Ok(items.clone()),
            _ => Err(RuntimeError::type_error("not a sequence")),
        })?
    }

    fn entries_of(
        &self,
        value: &InterpreterValue,
    ) -> RuntimeResult<Vec<(InterpreterValue, InterpreterValue)>> {
        let id = value
            .as_object()
            .ok_or_else(|| RuntimeError::type_error("not a dict"))?;
        self.with_body(id, |body| match body {
            Body::Dict(entries) => Ok(entries.clone()),
            _ => Err(RuntimeError::type_error("not a dict")),
        })?
    }

    fn error_message_of(&self, value: &InterpreterValue) -> Option<String> {
        let id = value.as_object()?;
        self.with_body(id, |body| match body {
            Body::Exception { class, message } => Some(format!("{}: {}", class, message)),
            _ => None,
        })
        .ok()
        .flatten()
    }

    fn object_id_of(&self, value: &InterpreterValue) -> Option<ObjectId> {
        value.as_object()
    }

    fn host_ref_of(&self, value: &InterpreterValue) -> Option<HostRef> {
        let id = value.as_object()?;
        self.with_body(id, |body| match body {
            Body::Host(host) => Some(*host),
            _ => None,
        })
        .ok()
        .flatten()
    }

    fn value_of_object(&self, object: ObjectId) -> RuntimeResult<InterpreterValue> {
        self.incref(object)?;
        Ok(InterpreterValue::Object(object))
    }

    fn discard(&self, value: InterpreterValue) {
        self.decref_value(&value);
    }

    fn make_null(&self) -> InterpreterValue {
        InterpreterValue::None
    }

    fn make_boolean(&self, value: bool) -> InterpreterValue {
        InterpreterValue::Bool(value)
    }

    /// Integral values within the exact range come back as ints.
    fn make_number(&self, value: f64) -> InterpreterValue {
        const EXACT: f64 = 9_007_199_254_740_992.0;
        if value.is_finite() && value.fract() == 0.0 && value.abs() <= EXACT {
            InterpreterValue::Int(value as i64)
        } else {
            InterpreterValue::Float(value)
        }
    }

    fn make_string(&self, value: &str) -> RuntimeResult<InterpreterValue> {
        Ok(InterpreterValue::str(value))
    }

    fn make_array(&self, items: Vec<InterpreterValue>) -> RuntimeResult<InterpreterValue> {
        Ok(self.list(items))
    }

    fn make_mapping(
        &self,
        entries: Vec<(String, InterpreterValue)>,
    ) -> RuntimeResult<InterpreterValue> {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (InterpreterValue::str(&key), value))
            .collect();
        Ok(self.dict(entries))
    }

    fn make_error(&self, message: &str) -> RuntimeResult<InterpreterValue> {
        Ok(self.exception("Exception", message))
    }

    fn make_host(&self, host: HostRef) -> RuntimeResult<InterpreterValue> {
        Ok(InterpreterValue::Object(self.alloc(Body::Host(host))))
    }

    fn get_property(&self, object: ObjectId, key: &str) -> RuntimeResult<InterpreterValue> {
        let lookup = self.with_body(object, |body| match body {
            Body::Dict(entries) => Lookup::Found(
                entries
                    .iter()
                    .find(|(k, _)| k.as_str() == Some(key))
                    .map(|(_, value)| value.clone()),
            ),
            Body::Instance { attrs, .. } => Lookup::Found(attrs.get(key).cloned()),
            Body::Function { name, .. } if key == "__name__" => {
                Lookup::Found(Some(InterpreterValue::str(name)))
            }
            Body::Exception { message, .. } if key == "message" => {
                Lookup::Found(Some(InterpreterValue::str(message)))
            }
            Body::List(items) | Body::Tuple(items) if key == "__len__" => {
                Lookup::Found(Some(InterpreterValue::Int(items.len() as i64)))
            }
            Body::Host(host) => Lookup::Host(*host),
            _ => Lookup::Found(None),
        })?;

        match lookup {
            Lookup::Found(Some(value)) => {
                self.incref_value(&value)?;
                Ok(value)
            }
            Lookup::Found(None) => Err(RuntimeError::NoSuchProperty(key.to_string())),
            Lookup::Host(host) => self.dispatch(host)?.get(host, key),
        }
    }

    fn set_property(
        &self,
        object: ObjectId,
        key: &str,
        value: InterpreterValue,
    ) -> RuntimeResult<()> {
        if let Some(host) = self.with_body(object, |body| match body {
            Body::Host(host) => Some(*host),
            _ => None,
        })? {
            return self.dispatch(host)?.set(host, key, value);
        }

        self.incref_value(&value)?;
        let replaced = {
            let mut objects = self.objects.borrow_mut();
            let slot = objects.get_mut(&object).ok_or(RuntimeError::Dead(object))?;
            match &mut slot.body {
                Body::Dict(entries) => {
                    match entries.iter_mut().find(|(k, _)| k.as_str() == Some(key)) {
                        Some((_, slot_value)) => Ok(Some(std::mem::replace(slot_value, value))),
                        None => {
                            entries.push((InterpreterValue::str(key), value));
                            Ok(None)
                        }
                    }
                }
                Body::Instance { attrs, .. } => Ok(attrs.insert(key.to_string(), value)),
                Body::List(items) => match key.parse::<usize>() {
                    Ok(index) if index < items.len() => {
                        Ok(Some(std::mem::replace(&mut items[index], value)))
                    }
                    Ok(index) if index == items.len() => {
                        items.push(value);
                        Ok(None)
                    }
                    _ => Err(value),
                },
                _ => Err(value),
            }
        };

        match replaced {
            Ok(old) => {
                if let Some(old) = old {
                    self.decref_value(&old);
                }
                Ok(())
            }
            Err(value) => {
                self.decref_value(&value);
                Err(RuntimeError::type_error(format!(
                    "cannot set attribute '{}' on {}",
                    key, object
                )))
            }
        }
    }

    fn own_keys(&self, object: ObjectId) -> RuntimeResult<Vec<String>> {
        let lookup = self.with_body(object, |body| match body {
            Body::Dict(entries) => Ok(entries
                .iter()
                .filter_map(|(key, _)| key.as_str().map(str::to_string))
                .collect()),
            Body::Instance { attrs, .. } => Ok(attrs.keys().cloned().collect()),
            Body::Exception { .. } => Ok(vec!["message".to_string()]),
            Body::Host(host) => Err(*host),
            _ => Ok(Vec::new()),
        })?;
        match lookup {
            Ok(keys) => Ok(keys),
            Err(host) => self.dispatch(host)?.keys(host),
        }
    }

    fn is_callable(&self, object: ObjectId) -> bool {
        self.with_body(object, |body| body.kind() == Kind::Callable)
            .unwrap_or(false)
    }

    fn call(
        &self,
        callee: ObjectId,
        args: Vec<InterpreterValue>,
    ) -> RuntimeResult<InterpreterValue> {
        let target = self.with_body(callee, |body| match body {
            Body::Function { code, .. } => Some(Callee::Native(code.clone())),
            Body::Host(host) => Some(Callee::Host(*host)),
            _ => None,
        })?;
        match target {
            Some(Callee::Native(code)) => code(self, &args),
            Some(Callee::Host(host)) => self.dispatch(host)?.call(host, args),
            None => Err(RuntimeError::NotCallable(callee)),
        }
    }

    fn global_object(&self) -> ObjectId {
        self.globals
    }

    fn attach_host(&self, scope: ScopeId, dispatch: Weak<dyn HostDispatch<InterpreterValue>>) {
        self.hosts.borrow_mut().insert(scope, dispatch);
    }

    fn detach_host(&self, scope: ScopeId) {
        self.hosts.borrow_mut().remove(&scope);
    }
}
