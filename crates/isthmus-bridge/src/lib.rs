//! # isthmus bridge
//!
//! Bidirectional value marshalling between a reference-counted interpreter
//! (Side A) and a garbage-collected script engine (Side B) embedded in one
//! process.
//!
//! ## Design
//!
//! - **Conversion**: primitives, arrays and string-keyed mappings are copied;
//!   callables and opaque objects cross as wrappers around the original
//! - **Identity**: one wrapper per object per scope, so a wrapper always
//!   compares equal to itself when it comes back
//! - **Ownership**: every wrapped object is kept alive by exactly one counted
//!   reference, released exactly once when its scope is torn down
//! - **Safety gate**: a configurable policy that may refuse a value before
//!   any conversion work happens
//! - **Facade**: named message handlers with a FIFO fallback queue, and
//!   event fan-out with per-listener failure isolation
//!
//! ## Example
//!
//! ```
//! use std::rc::Rc;
//! use isthmus_bridge::{Bridge, BridgeRuntime};
//! use isthmus_core::BridgeConfig;
//! use isthmus_heap::{Engine, EngineValue, Interpreter, InterpreterValue};
//!
//! let runtime = BridgeRuntime::initialized();
//! let bridge = Bridge::new(
//!     &runtime,
//!     Rc::new(Interpreter::new()),
//!     Rc::new(Engine::new()),
//!     BridgeConfig::default(),
//! )?;
//!
//! let converted = bridge.to_b(&InterpreterValue::Int(7))?;
//! assert_eq!(converted, EngineValue::Number(7.0));
//! # Ok::<(), isthmus_bridge::BridgeError>(())
//! ```

#![warn(clippy::all)]

pub mod cache;
mod convert;
pub mod error;
pub mod facade;
pub mod gate;
pub mod scope;
pub mod stats;
mod wrapper;

pub use cache::{BridgeRef, CountToken, IdentityCache};
pub use convert::MAX_EXACT_INTEGER;
pub use error::{
    BridgeError, BridgeResult, CallFailure, ConversionFailure, GateReason, HandleFault, SetupFault,
};
pub use facade::{Bridge, Delivery, EmitReport, ListenerFailure, MessageEnvelope};
pub use gate::{Inspect, NativeView, is_safe_to_cross};
pub use scope::{BridgeRuntime, Scope};
pub use stats::{BridgeStats, BridgeStatsSnapshot};
