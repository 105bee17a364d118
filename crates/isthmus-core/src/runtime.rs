//! Collaborator contracts consumed by the bridge.
//!
//! Both embedded runtimes expose the same set of primitives: classification
//! predicates, constructors, property read/write, own-key enumeration, a
//! callable predicate, a synchronous call primitive and explicit
//! acquire/release of a counted reference. The bridge is written once
//! against [`Runtime`] and works for either direction.

use std::fmt;
use std::rc::Weak;

use crate::error::RuntimeResult;
use crate::id::{HostRef, ObjectId, ScopeId, Side};
use crate::value::{Kind, NativeNumber, NativeStr};

/// Explicit counted-reference operations on a runtime's objects.
///
/// For the reference-counted interpreter these are incref/decref. For the
/// garbage-collected engine they add and remove a GC root. Every `retain`
/// taken by the bridge is paired with exactly one `release`.
pub trait ObjectRetainer {
    /// Take one counted reference. Fails if the object is already gone.
    fn retain(&self, object: ObjectId) -> RuntimeResult<()>;

    /// Give back one counted reference taken with [`retain`](Self::retain).
    fn release(&self, object: ObjectId);
}

/// Callback a runtime uses when script touches a host object.
///
/// Host objects are the runtime-side stand-ins for wrapped foreign objects.
/// The runtime does not know what they wrap; it forwards every property read,
/// write and call to the dispatch registered for the host's scope. Calls may
/// re-enter the bridge while an outer call is still on the stack.
pub trait HostDispatch<V> {
    fn get(&self, host: HostRef, key: &str) -> RuntimeResult<V>;

    fn set(&self, host: HostRef, key: &str, value: V) -> RuntimeResult<()>;

    fn call(&self, host: HostRef, args: Vec<V>) -> RuntimeResult<V>;

    fn keys(&self, host: HostRef) -> RuntimeResult<Vec<String>>;
}

/// Primitives one embedded runtime provides to the bridge.
///
/// Values are the runtime's own representation. Objects are addressed by a
/// non-owning [`ObjectId`]; nothing in this trait keeps an object alive except
/// [`ObjectRetainer::retain`].
///
/// Implementations are single-threaded: the bridge only ever calls them from
/// the thread that owns the runtime.
pub trait Runtime: ObjectRetainer + 'static {
    type Value: Clone + fmt::Debug + 'static;

    /// Which end of the bridge this runtime sits on.
    const SIDE: Side;

    // ---------------------------------------------------------------------
    // Classification
    // ---------------------------------------------------------------------

    fn kind_of(&self, value: &Self::Value) -> Kind;

    fn boolean_of(&self, value: &Self::Value) -> Option<bool>;

    fn number_of(&self, value: &Self::Value) -> Option<NativeNumber>;

    /// Raw string data in the runtime's own encoding.
    fn string_of(&self, value: &Self::Value) -> Option<NativeStr>;

    /// Elements of an Array-classified value, in order.
    fn elements_of(&self, value: &Self::Value) -> RuntimeResult<Vec<Self::Value>>;

    /// Entries of a Mapping-classified value. Keys are native values and may
    /// be of any kind.
    fn entries_of(&self, value: &Self::Value) -> RuntimeResult<Vec<(Self::Value, Self::Value)>>;

    fn error_message_of(&self, value: &Self::Value) -> Option<String>;

    /// Object identity for heap values; `None` for immediates.
    fn object_id_of(&self, value: &Self::Value) -> Option<ObjectId>;

    /// Token stored in a host object, if `value` is one.
    fn host_ref_of(&self, value: &Self::Value) -> Option<HostRef>;

    /// New reference to an existing object.
    fn value_of_object(&self, object: ObjectId) -> RuntimeResult<Self::Value>;

    /// Give back a reference returned by a constructor, `get_property`,
    /// `call` or `value_of_object` once the caller is done with it.
    /// Immediates and collector-managed values make this a no-op.
    fn discard(&self, value: Self::Value);

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    fn make_null(&self) -> Self::Value;

    fn make_boolean(&self, value: bool) -> Self::Value;

    fn make_number(&self, value: f64) -> Self::Value;

    fn make_string(&self, value: &str) -> RuntimeResult<Self::Value>;

    fn make_array(&self, items: Vec<Self::Value>) -> RuntimeResult<Self::Value>;

    fn make_mapping(&self, entries: Vec<(String, Self::Value)>) -> RuntimeResult<Self::Value>;

    fn make_error(&self, message: &str) -> RuntimeResult<Self::Value>;

    /// Allocate a host object standing in for a wrapped foreign object.
    fn make_host(&self, host: HostRef) -> RuntimeResult<Self::Value>;

    // ---------------------------------------------------------------------
    // Object primitives
    // ---------------------------------------------------------------------

    /// Property read. An absent property is an error, not null.
    fn get_property(&self, object: ObjectId, key: &str) -> RuntimeResult<Self::Value>;

    fn set_property(&self, object: ObjectId, key: &str, value: Self::Value) -> RuntimeResult<()>;

    fn own_keys(&self, object: ObjectId) -> RuntimeResult<Vec<String>>;

    fn is_callable(&self, object: ObjectId) -> bool;

    /// Synchronous invocation. Errors thrown on this side come back as
    /// [`RuntimeError::Thrown`](crate::RuntimeError::Thrown).
    fn call(&self, callee: ObjectId, args: Vec<Self::Value>) -> RuntimeResult<Self::Value>;

    fn global_object(&self) -> ObjectId;

    // ---------------------------------------------------------------------
    // Host bindings
    // ---------------------------------------------------------------------

    /// Route host objects tagged with `scope` to `dispatch`.
    fn attach_host(&self, scope: ScopeId, dispatch: Weak<dyn HostDispatch<Self::Value>>);

    /// Drop the route for `scope`; its host objects raise
    /// [`RuntimeError::Revoked`](crate::RuntimeError::Revoked) afterwards.
    fn detach_host(&self, scope: ScopeId);
}
