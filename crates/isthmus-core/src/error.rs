//! Errors reported by a runtime's own primitives.

use thiserror::Error;

use crate::id::{ObjectId, ScopeId};

/// Failure of a runtime primitive (property read, call, allocation).
///
/// These are the collaborator's errors. The bridge maps them onto its own
/// taxonomy depending on which operation failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Script threw while running on its own side
    #[error("{kind}: {message}")]
    Thrown { kind: String, message: String },

    /// Property lookup found nothing
    #[error("no property '{0}'")]
    NoSuchProperty(String),

    /// Object was freed (refcount reached zero)
    #[error("object {0} is no longer alive")]
    Dead(ObjectId),

    /// Object was reclaimed by the collector
    #[error("object {0} was collected")]
    Collected(ObjectId),

    /// Call target is not callable
    #[error("object {0} is not callable")]
    NotCallable(ObjectId),

    /// Value had the wrong shape for the primitive
    #[error("type error: {0}")]
    Type(String),

    /// Host object belongs to a scope with no live bridge binding
    #[error("host binding for {0} has been revoked")]
    Revoked(ScopeId),
}

impl RuntimeError {
    /// Create a thrown-exception error
    pub fn thrown(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Thrown {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    /// True when the target object no longer exists on its side.
    pub fn is_dead_object(&self) -> bool {
        matches!(self, Self::Dead(_) | Self::Collected(_) | Self::Revoked(_))
    }
}

/// Result type alias for runtime primitives
pub type RuntimeResult<T> = Result<T, RuntimeError>;
