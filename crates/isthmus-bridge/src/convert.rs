//! Value converter.
//!
//! [`import`] lifts a native value of either runtime into a [`ForeignValue`];
//! [`export`] lowers a [`ForeignValue`] into a runtime. Together they give
//! `to_b` and `to_a`. Data is copied; callables and opaque objects are
//! wrapped through the scope's identity cache and never deep-converted.
//!
//! Composite conversion is all-or-nothing: the first failing element aborts
//! the whole value and any partially built native values are discarded.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use indexmap::IndexMap;
use isthmus_core::{
    ForeignValue, HostRef, Kind, NativeNumber, NativeStr, ObjectRetainer, Runtime, RuntimeError,
    Side, WrapperRef,
};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::cache::CountToken;
use crate::error::{BridgeError, BridgeResult, ConversionFailure, HandleFault};
use crate::scope::ScopeCore;
use crate::wrapper;

/// Largest integer magnitude a double represents exactly.
pub const MAX_EXACT_INTEGER: u64 = 1 << 53;

enum Segment {
    Index(usize),
    Key(String),
}

/// Location inside the value being converted, rendered as `$[2].b`.
#[derive(Default)]
struct Path(SmallVec<[Segment; 8]>);

impl Path {
    fn push(&mut self, segment: Segment) {
        self.0.push(segment);
    }

    fn pop(&mut self) {
        self.0.pop();
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            match segment {
                Segment::Index(index) => write!(f, "[{}]", index)?,
                Segment::Key(key) => write!(f, ".{}", key)?,
            }
        }
        Ok(())
    }
}

/// Lift a native value of `R` into a [`ForeignValue`].
pub(crate) fn import<R: Runtime>(
    core: &ScopeCore,
    runtime: &Rc<R>,
    value: &R::Value,
) -> BridgeResult<ForeignValue> {
    Importer {
        core,
        runtime,
        path: Path::default(),
    }
    .value(value, 0)
}

/// Lower a [`ForeignValue`] into a new native value of `R`.
///
/// The result is a new reference owned by the caller.
pub(crate) fn export<R: Runtime>(
    core: &ScopeCore,
    runtime: &Rc<R>,
    value: &ForeignValue,
) -> BridgeResult<R::Value> {
    Exporter {
        core,
        runtime,
        path: Path::default(),
    }
    .value(value, 0)
}

fn decode(side: Side, text: NativeStr) -> Result<String, ConversionFailure> {
    match text {
        NativeStr::Utf8(bytes) => {
            String::from_utf8(bytes).map_err(|_| ConversionFailure::InvalidEncoding {
                side,
                encoding: "UTF-8",
            })
        }
        NativeStr::Utf16(units) => {
            String::from_utf16(&units).map_err(|_| ConversionFailure::InvalidEncoding {
                side,
                encoding: "UTF-16",
            })
        }
    }
}

struct Importer<'a, R: Runtime> {
    core: &'a ScopeCore,
    runtime: &'a Rc<R>,
    path: Path,
}

impl<R: Runtime> Importer<'_, R> {
    fn fail(&self, failure: ConversionFailure) -> BridgeError {
        BridgeError::conversion(self.path.to_string(), failure)
    }

    fn enter(&self, depth: usize) -> BridgeResult<usize> {
        let depth = depth + 1;
        let limit = self.core.config().max_conversion_depth;
        if depth > limit {
            return Err(self.fail(ConversionFailure::DepthExceeded { limit }));
        }
        Ok(depth)
    }

    fn value(&mut self, value: &R::Value, depth: usize) -> BridgeResult<ForeignValue> {
        let kind = self.runtime.kind_of(value);
        match kind {
            Kind::Null => Ok(ForeignValue::Null),
            Kind::Boolean => self
                .runtime
                .boolean_of(value)
                .map(ForeignValue::Boolean)
                .ok_or_else(|| self.fail(ConversionFailure::NoMapping(kind))),
            Kind::Number => match self.runtime.number_of(value) {
                Some(NativeNumber::Int(n)) if n.unsigned_abs() > MAX_EXACT_INTEGER => {
                    Err(self.fail(ConversionFailure::LossyInteger(n)))
                }
                Some(NativeNumber::Int(n)) => Ok(ForeignValue::Number(n as f64)),
                Some(NativeNumber::Float(n)) => Ok(ForeignValue::Number(n)),
                None => Err(self.fail(ConversionFailure::NoMapping(kind))),
            },
            Kind::String => {
                let text = self
                    .runtime
                    .string_of(value)
                    .ok_or_else(|| self.fail(ConversionFailure::NoMapping(kind)))?;
                decode(R::SIDE, text)
                    .map(ForeignValue::String)
                    .map_err(|failure| self.fail(failure))
            }
            Kind::Array => self.array(value, depth),
            Kind::Mapping => self.mapping(value, depth),
            Kind::Callable | Kind::Opaque => self.object(value, kind),
            Kind::Error => Ok(ForeignValue::Error(
                self.runtime.error_message_of(value).unwrap_or_default(),
            )),
            Kind::Unknown => Err(self.fail(ConversionFailure::NoMapping(kind))),
        }
    }

    fn array(&mut self, value: &R::Value, depth: usize) -> BridgeResult<ForeignValue> {
        let depth = self.enter(depth)?;
        let items = self
            .runtime
            .elements_of(value)
            .map_err(|e| self.fail(ConversionFailure::Runtime(e)))?;

        let mut converted = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            self.path.push(Segment::Index(index));
            converted.push(self.value(item, depth)?);
            self.path.pop();
        }
        Ok(ForeignValue::Array(converted))
    }

    fn mapping(&mut self, value: &R::Value, depth: usize) -> BridgeResult<ForeignValue> {
        let depth = self.enter(depth)?;
        let entries = self
            .runtime
            .entries_of(value)
            .map_err(|e| self.fail(ConversionFailure::Runtime(e)))?;

        let mut converted = IndexMap::with_capacity(entries.len());
        for (key, item) in &entries {
            if self.runtime.kind_of(key) != Kind::String {
                self.core.stats().dropped_keys.fetch_add(1, Ordering::Relaxed);
                warn!(
                    scope = %self.core.id(),
                    path = %self.path,
                    key_kind = %self.runtime.kind_of(key),
                    "dropping mapping entry with non-string key"
                );
                continue;
            }
            let key = self
                .runtime
                .string_of(key)
                .ok_or_else(|| self.fail(ConversionFailure::NoMapping(Kind::String)))
                .and_then(|text| decode(R::SIDE, text).map_err(|failure| self.fail(failure)))?;

            self.path.push(Segment::Key(key.clone()));
            let item = self.value(item, depth)?;
            self.path.pop();
            converted.insert(key, item);
        }
        Ok(ForeignValue::Mapping(converted))
    }

    fn object(&mut self, value: &R::Value, kind: Kind) -> BridgeResult<ForeignValue> {
        if let Some(host) = self.runtime.host_ref_of(value) {
            return self.resolve_host(host);
        }
        let object = self
            .runtime
            .object_id_of(value)
            .ok_or_else(|| self.fail(ConversionFailure::NoMapping(kind)))?;
        let handle = wrapper::wrap(self.core, self.runtime, object)
            .map_err(|e| self.fail(ConversionFailure::Runtime(e)))?;
        Ok(as_foreign(handle))
    }

    /// A host object on this side stands in for an object of the other side;
    /// hand back the wrapper it was made from.
    fn resolve_host(&self, host: HostRef) -> BridgeResult<ForeignValue> {
        if !self.core.is_live() {
            return Err(BridgeError::invalid_handle(
                host.handle,
                HandleFault::ScopeTornDown,
            ));
        }
        if host.scope != self.core.id() {
            return Err(BridgeError::invalid_handle(
                host.handle,
                HandleFault::ForeignScope(host.scope),
            ));
        }
        self.core
            .cache(R::SIDE.opposite())
            .borrow()
            .by_handle(host.handle)
            .map(as_foreign)
            .ok_or_else(|| BridgeError::invalid_handle(host.handle, HandleFault::Evicted))
    }
}

fn as_foreign(handle: WrapperRef) -> ForeignValue {
    if handle.capabilities().callable {
        ForeignValue::Callable(handle)
    } else {
        ForeignValue::Opaque(handle)
    }
}

struct Exporter<'a, R: Runtime> {
    core: &'a ScopeCore,
    runtime: &'a Rc<R>,
    path: Path,
}

impl<R: Runtime> Exporter<'_, R> {
    fn fail(&self, failure: ConversionFailure) -> BridgeError {
        BridgeError::conversion(self.path.to_string(), failure)
    }

    fn runtime_fail(&self, error: RuntimeError) -> BridgeError {
        self.fail(ConversionFailure::Runtime(error))
    }

    fn enter(&self, depth: usize) -> BridgeResult<usize> {
        let depth = depth + 1;
        let limit = self.core.config().max_conversion_depth;
        if depth > limit {
            return Err(self.fail(ConversionFailure::DepthExceeded { limit }));
        }
        Ok(depth)
    }

    fn discard_all(&self, values: impl IntoIterator<Item = R::Value>) {
        for value in values {
            self.runtime.discard(value);
        }
    }

    fn value(&mut self, value: &ForeignValue, depth: usize) -> BridgeResult<R::Value> {
        match value {
            ForeignValue::Null => Ok(self.runtime.make_null()),
            ForeignValue::Boolean(b) => Ok(self.runtime.make_boolean(*b)),
            ForeignValue::Number(n) => Ok(self.runtime.make_number(*n)),
            ForeignValue::String(s) => self
                .runtime
                .make_string(s)
                .map_err(|e| self.runtime_fail(e)),
            ForeignValue::Array(items) => {
                let depth = self.enter(depth)?;
                let mut converted = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    self.path.push(Segment::Index(index));
                    match self.value(item, depth) {
                        Ok(native) => converted.push(native),
                        Err(error) => {
                            self.discard_all(converted);
                            return Err(error);
                        }
                    }
                    self.path.pop();
                }
                self.runtime
                    .make_array(converted)
                    .map_err(|e| self.runtime_fail(e))
            }
            ForeignValue::Mapping(entries) => {
                let depth = self.enter(depth)?;
                let mut converted = Vec::with_capacity(entries.len());
                for (key, item) in entries {
                    self.path.push(Segment::Key(key.clone()));
                    match self.value(item, depth) {
                        Ok(native) => converted.push((key.clone(), native)),
                        Err(error) => {
                            self.discard_all(converted.into_iter().map(|(_, native)| native));
                            return Err(error);
                        }
                    }
                    self.path.pop();
                }
                self.runtime
                    .make_mapping(converted)
                    .map_err(|e| self.runtime_fail(e))
            }
            ForeignValue::Error(message) => self
                .runtime
                .make_error(message)
                .map_err(|e| self.runtime_fail(e)),
            ForeignValue::Callable(handle) | ForeignValue::Opaque(handle) => self.handle(handle),
        }
    }

    fn handle(&self, handle: &WrapperRef) -> BridgeResult<R::Value> {
        if !handle.is_live() {
            return Err(BridgeError::invalid_handle(
                handle.id(),
                HandleFault::ScopeTornDown,
            ));
        }

        if handle.side() == R::SIDE {
            // Returning home: hand back the original object.
            self.core
                .cache(R::SIDE)
                .borrow()
                .validate(handle)
                .map_err(|fault| BridgeError::invalid_handle(handle.id(), fault))?;
            return self
                .runtime
                .value_of_object(handle.object())
                .map_err(|e| self.runtime_fail(e));
        }

        self.proxy(handle)
    }

    /// Host object on this side for a wrapper of the other side, created once
    /// per wrapper and kept alive by the wrapper's bridge reference.
    fn proxy(&self, handle: &WrapperRef) -> BridgeResult<R::Value> {
        let cache = self.core.cache(handle.side());
        let existing = cache
            .borrow()
            .proxy_of(handle)
            .map_err(|fault| BridgeError::invalid_handle(handle.id(), fault))?;
        if let Some(proxy) = existing {
            return self
                .runtime
                .value_of_object(proxy)
                .map_err(|e| self.runtime_fail(e));
        }

        let created = self
            .runtime
            .make_host(handle.host_ref())
            .map_err(|e| self.runtime_fail(e))?;
        let Some(object) = self.runtime.object_id_of(&created) else {
            self.runtime.discard(created);
            return Err(self.fail(ConversionFailure::NoMapping(Kind::Opaque)));
        };
        let retainer: Rc<dyn ObjectRetainer> = self.runtime.clone();
        let token = match CountToken::acquire(retainer, R::SIDE, object) {
            Ok(token) => token,
            Err(e) => {
                self.runtime.discard(created);
                return Err(self.runtime_fail(e));
            }
        };
        if cache.borrow_mut().set_proxy(handle, token).is_err() {
            self.runtime.discard(created);
            return Err(BridgeError::invalid_handle(handle.id(), HandleFault::Evicted));
        }
        trace!(handle = %handle.id(), side = %R::SIDE, proxy = %object, "host proxy created");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_rendering() {
        let mut path = Path::default();
        assert_eq!(path.to_string(), "$");
        path.push(Segment::Index(2));
        path.push(Segment::Key("b".into()));
        assert_eq!(path.to_string(), "$[2].b");
        path.pop();
        assert_eq!(path.to_string(), "$[2]");
    }

    #[test]
    fn test_decode_rejects_invalid_text() {
        assert_eq!(
            decode(Side::Interpreter, NativeStr::Utf8(vec![0x66, 0xff])),
            Err(ConversionFailure::InvalidEncoding {
                side: Side::Interpreter,
                encoding: "UTF-8",
            })
        );
        assert!(decode(Side::Engine, NativeStr::Utf16(vec![0xDC00])).is_err());
        assert_eq!(
            decode(Side::Engine, NativeStr::Utf16("ok".encode_utf16().collect())).as_deref(),
            Ok("ok")
        );
    }
}
