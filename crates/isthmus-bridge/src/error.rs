//! Error types for isthmus-bridge
//!
//! Every public bridge operation fails with exactly one [`BridgeError`]
//! variant. The sub-reason enums say why, so callers can match on the
//! category without parsing messages.

use isthmus_core::{Capabilities, Direction, HandleId, Kind, RuntimeError, ScopeId, Side};
use thiserror::Error;

/// Errors that can occur during bridge operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Operation attempted before setup, after shutdown, or on a closed scope
    #[error("bridge not initialized: {0}")]
    UninitializedBridge(SetupFault),

    /// Value blocked by the safety gate policy
    #[error("unsafe value ({direction}): {reason}")]
    UnsafeValue {
        direction: Direction,
        reason: GateReason,
    },

    /// Value has no mapping, invalid encoding, or nesting too deep
    #[error("conversion error at {path}: {failure}")]
    Conversion {
        path: String,
        failure: ConversionFailure,
    },

    /// Wrapper used after its scope was torn down, or capability mismatch
    #[error("invalid handle {handle}: {fault}")]
    InvalidHandle { handle: HandleId, fault: HandleFault },

    /// Property lookup or write failed on the owning side
    #[error("property access '{key}' failed: {source}")]
    PropertyAccess { key: String, source: RuntimeError },

    /// Foreign invocation failed
    #[error("call error: {0}")]
    Call(CallFailure),
}

/// Why the bridge refused to run an operation at all.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetupFault {
    #[error("bridge runtime has not been initialized")]
    NotInitialized,

    #[error("{0} has been torn down")]
    ScopeClosed(ScopeId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Policy rule that rejected a value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    #[error("callable values may not cross")]
    CallableBlocked,

    #[error("{0} values may not cross")]
    CompositeBlocked(Kind),

    #[error("nesting exceeds gate depth {limit}")]
    TooDeep { limit: usize },
}

/// Why a value could not be converted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionFailure {
    #[error("no mapping for {0} value")]
    NoMapping(Kind),

    #[error("string from side {side} is not valid {encoding}")]
    InvalidEncoding { side: Side, encoding: &'static str },

    #[error("integer {0} is not exactly representable as a double")]
    LossyInteger(i64),

    #[error("nesting exceeds conversion depth {limit}")]
    DepthExceeded { limit: usize },

    #[error("runtime failure: {0}")]
    Runtime(RuntimeError),
}

/// Why a wrapper handle was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleFault {
    #[error("owning scope has been torn down")]
    ScopeTornDown,

    #[error("handle belongs to {0}")]
    ForeignScope(ScopeId),

    #[error("handle wraps a side {0} object")]
    WrongSide(Side),

    #[error("handle is no longer cached")]
    Evicted,

    #[error("requires {required}, handle allows {actual}")]
    CapabilityMismatch {
        required: Capabilities,
        actual: Capabilities,
    },
}

/// Why a foreign call failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// Target has no callable capability
    #[error("{0} is not callable")]
    NotCallable(String),

    /// Foreign code threw on its own side
    #[error("{kind}: {message}")]
    Thrown { kind: String, message: String },

    /// Too many nested foreign calls
    #[error("recursion limit of {limit} nested calls exceeded")]
    RecursionLimit { limit: usize },

    /// The runtime could not perform the call
    #[error("{0}")]
    Runtime(RuntimeError),
}

impl BridgeError {
    /// Create a conversion error at `path`
    pub fn conversion(path: impl Into<String>, failure: ConversionFailure) -> Self {
        Self::Conversion {
            path: path.into(),
            failure,
        }
    }

    /// Create an invalid-handle error
    pub fn invalid_handle(handle: HandleId, fault: HandleFault) -> Self {
        Self::InvalidHandle { handle, fault }
    }

    /// Create a property access error
    pub fn property(key: impl Into<String>, source: RuntimeError) -> Self {
        Self::PropertyAccess {
            key: key.into(),
            source,
        }
    }

    /// Map a failed runtime invocation onto the call taxonomy.
    pub fn from_call(error: RuntimeError) -> Self {
        Self::Call(match error {
            RuntimeError::Thrown { kind, message } => CallFailure::Thrown { kind, message },
            RuntimeError::NotCallable(object) => CallFailure::NotCallable(object.to_string()),
            other => CallFailure::Runtime(other),
        })
    }

    /// Taxonomy name, stable across messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::UninitializedBridge(_) => "UninitializedBridge",
            Self::UnsafeValue { .. } => "UnsafeValue",
            Self::Conversion { .. } => "ConversionError",
            Self::InvalidHandle { .. } => "InvalidHandle",
            Self::PropertyAccess { .. } => "PropertyAccessError",
            Self::Call(_) => "CallError",
        }
    }

    pub fn is_unsafe_value(&self) -> bool {
        matches!(self, Self::UnsafeValue { .. })
    }

    pub fn is_conversion(&self) -> bool {
        matches!(self, Self::Conversion { .. })
    }

    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, Self::InvalidHandle { .. })
    }

    /// Counted in `serialization_errors`.
    pub fn is_serialization_error(&self) -> bool {
        self.is_unsafe_value() || self.is_conversion()
    }

    /// Report this error to script running inside a runtime.
    ///
    /// Exceptions thrown by foreign code and missing properties keep their
    /// original shape so they surface unchanged through nested calls.
    pub fn into_runtime_error(self) -> RuntimeError {
        match self {
            Self::Call(CallFailure::Thrown { kind, message }) => {
                RuntimeError::Thrown { kind, message }
            }
            Self::PropertyAccess {
                source: RuntimeError::NoSuchProperty(key),
                ..
            } => RuntimeError::NoSuchProperty(key),
            other => RuntimeError::thrown(other.kind_name(), other.to_string()),
        }
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thrown_errors_keep_their_shape() {
        let error = BridgeError::from_call(RuntimeError::thrown("ValueError", "bad input"));
        assert_eq!(error.kind_name(), "CallError");
        assert_eq!(
            error.into_runtime_error(),
            RuntimeError::thrown("ValueError", "bad input")
        );
    }

    #[test]
    fn test_missing_property_maps_back() {
        let error = BridgeError::property("title", RuntimeError::NoSuchProperty("title".into()));
        assert_eq!(
            error.into_runtime_error(),
            RuntimeError::NoSuchProperty("title".into())
        );
    }

    #[test]
    fn test_serialization_classification() {
        let gate = BridgeError::UnsafeValue {
            direction: Direction::AToB,
            reason: GateReason::CallableBlocked,
        };
        let conversion = BridgeError::conversion("$[2]", ConversionFailure::NoMapping(Kind::Unknown));
        let handle = BridgeError::invalid_handle(HandleId::from_raw(1), HandleFault::Evicted);
        assert!(gate.is_serialization_error());
        assert!(conversion.is_serialization_error());
        assert!(!handle.is_serialization_error());
        assert_eq!(
            conversion.to_string(),
            "conversion error at $[2]: no mapping for unknown value"
        );
    }

    #[test]
    fn test_other_errors_become_named_exceptions() {
        let error = BridgeError::Call(CallFailure::RecursionLimit { limit: 3 });
        match error.into_runtime_error() {
            RuntimeError::Thrown { kind, message } => {
                assert_eq!(kind, "CallError");
                assert!(message.contains("recursion limit"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
