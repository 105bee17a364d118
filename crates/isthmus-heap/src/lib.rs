//! # isthmus heap runtimes
//!
//! Two small in-process runtimes implementing [`isthmus_core::Runtime`], one
//! for each end of the bridge:
//!
//! - [`Interpreter`] (Side A): objects carry an explicit reference count and
//!   are freed the moment it reaches zero. Containers own their children.
//! - [`Engine`] (Side B): objects live until a [`Engine::collect`] pass finds
//!   them unreachable from the global object or a root.
//!
//! Neither is a language implementation. They model exactly the primitives the
//! bridge consumes, with the two ownership disciplines that make bridging hard.
//!
//! ## Reference discipline (both runtimes)
//!
//! - `make_*`, `get_property`, `call` and `value_of_object` return new
//!   references owned by the caller.
//! - `make_array` and `make_mapping` steal the references of their items.
//! - `call` and `set_property` borrow their arguments.
//! - `elements_of` and `entries_of` return borrowed values.
//! - [`Runtime::discard`] gives back a reference obtained from the above.

#![warn(clippy::all)]

mod engine;
mod interpreter;

pub use engine::{Engine, EngineFunction, EngineValue};
pub use interpreter::{Interpreter, InterpreterFunction, InterpreterValue};
