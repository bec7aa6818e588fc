//! Kestrel is an embeddable query-execution engine. Hosts hand it a compiled
//! [`vm::Module`] (bytecode plus a function table) and invoke a named entry
//! function; the interpreter dispatches bytecodes which drive the vectorized
//! column kernels, hash tables and sorters in [`exec`].

pub mod engine;
pub mod exec;
pub mod pool;
pub mod types;
pub mod util;
pub mod vm;
