//! Identifiers shared by both runtimes and the bridge.

use std::fmt;

/// Which runtime owns a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Side {
    /// The reference-counted interpreter.
    Interpreter,
    /// The garbage-collected script engine.
    Engine,
}

impl Side {
    /// The runtime on the other end of the bridge.
    pub fn opposite(self) -> Side {
        match self {
            Side::Interpreter => Side::Engine,
            Side::Engine => Side::Interpreter,
        }
    }

    /// Short label used in logs and error messages.
    pub fn label(self) -> &'static str {
        match self {
            Side::Interpreter => "A",
            Side::Engine => "B",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Direction a value travels across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    /// Interpreter to engine.
    AToB,
    /// Engine to interpreter.
    BToA,
}

impl Direction {
    /// Side the value leaves.
    pub fn source(self) -> Side {
        match self {
            Direction::AToB => Side::Interpreter,
            Direction::BToA => Side::Engine,
        }
    }

    /// Side the value arrives on.
    pub fn target(self) -> Side {
        self.source().opposite()
    }

    /// Direction of a value leaving `side`.
    pub fn from_source(side: Side) -> Direction {
        match side {
            Side::Interpreter => Direction::AToB,
            Side::Engine => Direction::BToA,
        }
    }

    pub fn reverse(self) -> Direction {
        Direction::from_source(self.target())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => f.write_str("A->B"),
            Direction::BToA => f.write_str("B->A"),
        }
    }
}

/// Raw, non-owning identity of an object inside one runtime.
///
/// This is the bridge's notion of a foreign pointer: it names an object but
/// keeps nothing alive. Only a count token taken through
/// [`ObjectRetainer`](crate::ObjectRetainer) keeps the object reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Identity of one owning scope (a document, an interpreter sub-context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Identity of one wrapper within its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// What a wrapper allows its holder to do with the foreign object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    pub callable: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        readable: false,
        writable: false,
        callable: false,
    };

    /// Property get only.
    pub const READ: Capabilities = Capabilities {
        readable: true,
        writable: false,
        callable: false,
    };

    /// Property set only.
    pub const WRITE: Capabilities = Capabilities {
        readable: false,
        writable: true,
        callable: false,
    };

    /// Property get and set.
    pub const READ_WRITE: Capabilities = Capabilities {
        readable: true,
        writable: true,
        callable: false,
    };

    /// Invocation only.
    pub const CALL: Capabilities = Capabilities {
        readable: false,
        writable: false,
        callable: true,
    };

    pub const ALL: Capabilities = Capabilities {
        readable: true,
        writable: true,
        callable: true,
    };

    /// True when every capability in `required` is present in `self`.
    pub fn contains(self, required: Capabilities) -> bool {
        (self.readable || !required.readable)
            && (self.writable || !required.writable)
            && (self.callable || !required.callable)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.readable { 'r' } else { '-' };
        let w = if self.writable { 'w' } else { '-' };
        let x = if self.callable { 'x' } else { '-' };
        write!(f, "{}{}{}", r, w, x)
    }
}

/// Token a runtime stores inside a host object that stands in for a
/// wrapped foreign object.
///
/// When script on one side touches such a host object, the runtime hands the
/// token back to the bridge through [`HostDispatch`](crate::HostDispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRef {
    pub scope: ScopeId,
    pub handle: HandleId,
    pub capabilities: Capabilities,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::AToB.source(), Side::Interpreter);
        assert_eq!(Direction::AToB.target(), Side::Engine);
        assert_eq!(Direction::BToA.reverse(), Direction::AToB);
        assert_eq!(Direction::from_source(Side::Engine), Direction::BToA);
    }

    #[test]
    fn test_capabilities_contains() {
        assert!(Capabilities::ALL.contains(Capabilities::READ_WRITE));
        assert!(Capabilities::READ_WRITE.contains(Capabilities::READ));
        assert!(!Capabilities::READ.contains(Capabilities::CALL));
        assert!(Capabilities::CALL.contains(Capabilities::NONE));
        assert_eq!(Capabilities::READ.to_string(), "r--");
    }
}
