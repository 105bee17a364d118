//! Safety gate.
//!
//! Runs before a value crosses and decides from its classification alone
//! whether it may cross. The walk never descends past `max_depth + 1`
//! levels, so cyclic structures terminate with [`GateReason::TooDeep`].

use isthmus_core::{Direction, ForeignValue, GatePolicy, Kind, Runtime};
use tracing::trace;

use crate::error::{BridgeError, GateReason};

/// Read-only view of a value the gate can classify and descend into.
pub trait Inspect {
    fn kind(&self) -> Kind;

    /// Visit the children of an Array or Mapping; stops at the first error.
    fn for_each_child(
        &self,
        visit: &mut dyn FnMut(&Self) -> Result<(), GateReason>,
    ) -> Result<(), GateReason>;
}

impl Inspect for ForeignValue {
    fn kind(&self) -> Kind {
        ForeignValue::kind(self)
    }

    fn for_each_child(
        &self,
        visit: &mut dyn FnMut(&Self) -> Result<(), GateReason>,
    ) -> Result<(), GateReason> {
        match self {
            ForeignValue::Array(items) => items.iter().try_for_each(|item| visit(item)),
            ForeignValue::Mapping(entries) => entries.values().try_for_each(|value| visit(value)),
            _ => Ok(()),
        }
    }
}

/// A runtime's native value seen through its classification primitives.
pub struct NativeView<'r, R: Runtime> {
    runtime: &'r R,
    value: R::Value,
}

impl<'r, R: Runtime> NativeView<'r, R> {
    pub fn new(runtime: &'r R, value: R::Value) -> Self {
        Self { runtime, value }
    }
}

impl<R: Runtime> Inspect for NativeView<'_, R> {
    fn kind(&self) -> Kind {
        self.runtime.kind_of(&self.value)
    }

    fn for_each_child(
        &self,
        visit: &mut dyn FnMut(&Self) -> Result<(), GateReason>,
    ) -> Result<(), GateReason> {
        // Unreadable composites are left for the converter to report.
        let children = match self.kind() {
            Kind::Array => self.runtime.elements_of(&self.value).unwrap_or_default(),
            Kind::Mapping => self
                .runtime
                .entries_of(&self.value)
                .map(|entries| entries.into_iter().map(|(_, value)| value).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        children
            .into_iter()
            .try_for_each(|value| visit(&NativeView::new(self.runtime, value)))
    }
}

/// Check `value` against `policy`.
pub fn check<V: Inspect>(
    policy: &GatePolicy,
    value: &V,
    direction: Direction,
) -> Result<(), BridgeError> {
    walk(policy, value, 0).map_err(|reason| {
        trace!(direction = %direction, reason = %reason, "value rejected by gate");
        BridgeError::UnsafeValue { direction, reason }
    })
}

/// True when `value` may cross in `direction` under `policy`.
pub fn is_safe_to_cross<V: Inspect>(policy: &GatePolicy, value: &V, direction: Direction) -> bool {
    check(policy, value, direction).is_ok()
}

fn walk<V: Inspect>(policy: &GatePolicy, value: &V, depth: usize) -> Result<(), GateReason> {
    let kind = value.kind();
    if kind == Kind::Callable && !policy.allow_callable_passing {
        return Err(GateReason::CallableBlocked);
    }
    if kind.is_composite() && !policy.allow_composite_objects {
        return Err(GateReason::CompositeBlocked(kind));
    }
    if matches!(kind, Kind::Array | Kind::Mapping) {
        let depth = depth + 1;
        if depth > policy.max_depth {
            return Err(GateReason::TooDeep {
                limit: policy.max_depth,
            });
        }
        value.for_each_child(&mut |child| walk(policy, child, depth))?;
    }
    Ok(())
}
