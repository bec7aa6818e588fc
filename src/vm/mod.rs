//! The register-machine bytecode layer: instruction encoding, compiled
//! modules, the programmatic emitter, the interpreter, and the builtin
//! catalog bridging bytecode to the native runtime structures.

pub mod builtins;
pub mod bytecode;
pub mod emitter;
pub mod interp;
pub mod module;

pub use builtins::Builtin;
pub use bytecode::{Bytecode, LocalVar, OperandType};
pub use emitter::{FunctionBuilder, Label, ModuleBuilder};
pub use interp::{ExecError, VM};
pub use module::{FunctionInfo, LocalInfo, Module, ModuleError};
