//! isthmus-core - value model and collaborator contracts for the isthmus bridge.
//!
//! The bridge connects two runtimes embedded in one process:
//!
//! - **Side A**: a reference-counted interpreter
//! - **Side B**: a garbage-collected script engine
//!
//! Neither runtime understands the other's memory model. This crate holds the
//! pieces both sides and the bridge agree on:
//!
//! - [`ForeignValue`]: the runtime-neutral classification every value passes
//!   through on its way across
//! - [`Runtime`]: the primitives the bridge consumes from either side
//! - [`ObjectRetainer`]: explicit count-token acquire/release
//! - [`HostDispatch`]: the callback a runtime uses to reach back into the
//!   bridge when script invokes a wrapped foreign object
//! - [`BridgeConfig`]: the per-scope tunables
//!
//! # Layering
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ Side A (Interpreter)     │   │ Side B (Engine)          │
//! │ impl Runtime             │   │ impl Runtime             │
//! └────────────┬─────────────┘   └─────────────┬────────────┘
//!              │         isthmus-bridge        │
//!              └──────► ForeignValue ◄─────────┘
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod runtime;
pub mod value;

pub use config::{BridgeConfig, ConfigError, GatePolicy};
pub use error::{RuntimeError, RuntimeResult};
pub use id::{Capabilities, Direction, HandleId, HostRef, ObjectId, ScopeId, Side};
pub use runtime::{HostDispatch, ObjectRetainer, Runtime};
pub use value::{ForeignValue, Kind, Liveness, NativeNumber, NativeStr, WrapperHandle, WrapperRef};

pub mod prelude {
    pub use crate::config::{BridgeConfig, GatePolicy};
    pub use crate::error::{RuntimeError, RuntimeResult};
    pub use crate::id::{Capabilities, Direction, HandleId, HostRef, ObjectId, ScopeId, Side};
    pub use crate::runtime::{HostDispatch, ObjectRetainer, Runtime};
    pub use crate::value::{ForeignValue, Kind, NativeNumber, NativeStr, WrapperRef};
}
