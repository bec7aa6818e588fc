//! Host binary: runs the `main` function of a compiled module file.
//!
//! Usage: `kestrel <module.kbc>`. The module's `main` must follow the entry
//! contract `main(execCtx) -> int32`, i.e. two pointer parameters: the
//! out-pointer for the 32-bit result and the execution context.
//!
//! Exit codes: 0 on success, 1 on argument errors, 2 when the module fails
//! to load or has no suitable `main`, 3 on runtime failure.

use std::process::ExitCode;
use std::sync::Arc;

use kestrel::engine::Engine;
use kestrel::vm::{Module, VM};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(path), None) = (args.next(), args.next()) else {
        eprintln!("usage: kestrel <module.kbc>");
        return ExitCode::from(1);
    };

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: cannot read {path}: {err}");
            return ExitCode::from(1);
        }
    };

    let module = match Module::deserialize(&bytes) {
        Ok(module) => Arc::new(module),
        Err(err) => {
            eprintln!("error: invalid module: {err}");
            return ExitCode::from(2);
        }
    };

    let Some((main_id, main_info)) = module.function_by_name("main") else {
        eprintln!("error: module has no 'main' function");
        return ExitCode::from(2);
    };
    if main_info.params.len() != 2 {
        eprintln!("error: 'main' must take (execCtx) and return int32");
        return ExitCode::from(2);
    }

    let engine = Engine::new();
    let mut exec_ctx = engine.new_execution_context();
    let mut result: i32 = 0;

    let mut packed = [0u8; 16];
    packed[..8].copy_from_slice(&(&mut result as *mut i32 as usize).to_le_bytes());
    packed[8..].copy_from_slice(&(&mut exec_ctx as *mut _ as usize).to_le_bytes());

    match VM::invoke(&module, main_id, &packed) {
        Ok(()) => {
            println!("{result}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: execution failed: {err}");
            ExitCode::from(3)
        }
    }
}
