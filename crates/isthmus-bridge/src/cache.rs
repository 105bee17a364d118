//! Identity cache and counted bridge references.
//!
//! Each scope keeps one [`IdentityCache`] per side. An entry exists for every
//! object that has been wrapped in that scope and owns the [`BridgeRef`] that
//! keeps the object alive. Entries are only ever removed by
//! [`IdentityCache::evict_all`] at scope teardown, so a given object has at
//! most one wrapper per scope for the scope's whole lifetime.

use std::fmt;
use std::rc::Rc;

use isthmus_core::{
    HandleId, ObjectId, ObjectRetainer, RuntimeResult, ScopeId, Side, WrapperRef,
};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::HandleFault;

/// One counted reference on one object, released exactly once on drop.
///
/// On the interpreter this is an incref/decref pair; on the engine it is a
/// GC root.
pub struct CountToken {
    side: Side,
    object: ObjectId,
    retainer: Rc<dyn ObjectRetainer>,
}

impl CountToken {
    /// Take a new counted reference on `object`.
    pub fn acquire(
        retainer: Rc<dyn ObjectRetainer>,
        side: Side,
        object: ObjectId,
    ) -> RuntimeResult<Self> {
        retainer.retain(object)?;
        trace!(side = %side, object = %object, "count acquired");
        Ok(Self {
            side,
            object,
            retainer,
        })
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

impl Drop for CountToken {
    fn drop(&mut self) {
        self.retainer.release(self.object);
        trace!(side = %self.side, object = %self.object, "count released");
    }
}

impl fmt::Debug for CountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountToken({}:{})", self.side, self.object)
    }
}

/// The single owned reference behind a wrapper: one count on the wrapped
/// object and, once the wrapper has been handed to the other side, one count
/// on the host object standing in for it there.
#[derive(Debug)]
pub struct BridgeRef {
    target: CountToken,
    proxy: Option<CountToken>,
}

impl BridgeRef {
    pub fn new(target: CountToken) -> Self {
        Self {
            target,
            proxy: None,
        }
    }

    pub fn target(&self) -> ObjectId {
        self.target.object()
    }

    /// Host object on the other side, if one has been created.
    pub fn proxy(&self) -> Option<ObjectId> {
        self.proxy.as_ref().map(CountToken::object)
    }
}

struct CacheEntry {
    handle: WrapperRef,
    reference: BridgeRef,
}

/// Per-scope map from object identity to the wrapper created for it.
pub struct IdentityCache {
    side: Side,
    scope: ScopeId,
    entries: FxHashMap<ObjectId, CacheEntry>,
    by_handle: FxHashMap<HandleId, ObjectId>,
}

impl IdentityCache {
    pub fn new(side: Side, scope: ScopeId) -> Self {
        Self {
            side,
            scope,
            entries: FxHashMap::default(),
            by_handle: FxHashMap::default(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Wrapper previously created for `object`.
    pub fn get(&self, object: ObjectId) -> Option<WrapperRef> {
        self.entries.get(&object).map(|entry| entry.handle.clone())
    }

    pub fn by_handle(&self, handle: HandleId) -> Option<WrapperRef> {
        let object = self.by_handle.get(&handle)?;
        self.get(*object)
    }

    /// Check that `handle` is the wrapper this cache holds for its object.
    pub fn validate(&self, handle: &WrapperRef) -> Result<(), HandleFault> {
        if handle.scope() != self.scope {
            return Err(HandleFault::ForeignScope(handle.scope()));
        }
        if handle.side() != self.side {
            return Err(HandleFault::WrongSide(handle.side()));
        }
        match self.entries.get(&handle.object()) {
            Some(entry) if Rc::ptr_eq(&entry.handle, handle) => Ok(()),
            _ => Err(HandleFault::Evicted),
        }
    }

    /// Store a freshly created wrapper.
    pub fn insert(&mut self, handle: WrapperRef, reference: BridgeRef) {
        debug_assert_eq!(handle.object(), reference.target());
        self.by_handle.insert(handle.id(), handle.object());
        self.entries
            .insert(handle.object(), CacheEntry { handle, reference });
    }

    /// Host object standing in for `handle` on the other side.
    pub fn proxy_of(&self, handle: &WrapperRef) -> Result<Option<ObjectId>, HandleFault> {
        self.validate(handle)?;
        Ok(self
            .entries
            .get(&handle.object())
            .and_then(|entry| entry.reference.proxy()))
    }

    /// Attach the count on a newly created host object to `handle`'s entry.
    /// Returns the token back if the entry is gone.
    pub fn set_proxy(&mut self, handle: &WrapperRef, proxy: CountToken) -> Result<(), CountToken> {
        match self.entries.get_mut(&handle.object()) {
            Some(entry) if entry.reference.proxy.is_none() => {
                entry.reference.proxy = Some(proxy);
                Ok(())
            }
            _ => Err(proxy),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry. The returned references still hold their counts;
    /// dropping them releases each exactly once.
    pub fn evict_all(&mut self) -> Vec<BridgeRef> {
        self.by_handle.clear();
        self.entries
            .drain()
            .map(|(_, entry)| entry.reference)
            .collect()
    }
}
