//! The bytecode interpreter: frame allocation, the dispatch loop, and the
//! calling convention that bridges bytecode to the native runtime
//! structures.
//!
//! Handlers only move values between frame slots and the instruction
//! stream; all real work lives in the exec layer and is invoked through the
//! dedicated bridge opcodes. Runtime callbacks (hash, key-equality,
//! comparators) re-enter the interpreter through the module's function
//! table using out-pointer returns.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::ExecutionContext;
use crate::exec::ops;
use crate::exec::projection::VectorProjectionIterator;
use crate::exec::sorter::CompareFn;
use crate::exec::{AggregationHashTable, JoinHashTable, Sorter};
use crate::pool::ThreadStateContainer;
use crate::vm::bytecode::{AddressMode, Bytecode, LocalVar};
use crate::vm::module::Module;

/// Frames at or below this size use the small stack buffer, so the common
/// case never zeroes more than 4 KiB per call.
pub const SOFT_MAX_FRAME_SIZE: usize = 4 * 1024;
/// Largest frame that still lives on the stack; anything bigger is
/// heap-allocated.
pub const HARD_MAX_FRAME_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub enum ExecError {
    UnknownFunction(u16),
    FunctionNotFound(String),
    BadArgumentSize { expected: usize, actual: usize },
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::UnknownFunction(id) => write!(f, "no function with id {id}"),
            ExecError::FunctionNotFound(name) => write!(f, "no function named '{name}'"),
            ExecError::BadArgumentSize { expected, actual } => {
                write!(f, "argument buffer is {actual} bytes, function expects {expected}")
            }
        }
    }
}

impl std::error::Error for ExecError {}

/// Runs `body` with a zeroed frame buffer of `size` bytes: a small stack
/// buffer up to [`SOFT_MAX_FRAME_SIZE`], a large stack buffer up to
/// [`HARD_MAX_FRAME_SIZE`], and the heap beyond that.
fn with_frame<R>(size: usize, body: impl FnOnce(*mut u8) -> R) -> R {
    if size <= SOFT_MAX_FRAME_SIZE {
        let mut buf = [0u8; SOFT_MAX_FRAME_SIZE];
        body(buf.as_mut_ptr())
    } else if size <= HARD_MAX_FRAME_SIZE {
        let mut buf = [0u8; HARD_MAX_FRAME_SIZE];
        body(buf.as_mut_ptr())
    } else {
        let mut buf = vec![0u8; size];
        body(buf.as_mut_ptr())
    }
}

/// A function's live frame: parameters, locals and temporaries at
/// compile-time offsets.
struct Frame {
    data: *mut u8,
    size: usize,
}

impl Frame {
    #[inline]
    fn slot(&self, var: LocalVar) -> *mut u8 {
        debug_assert!(
            (var.offset() as usize) < self.size,
            "local offset {} beyond frame of {} bytes",
            var.offset(),
            self.size
        );
        unsafe { self.data.add(var.offset() as usize) }
    }

    /// Reads a by-value scalar local.
    #[inline]
    fn scalar<T: Copy>(&self, encoded: u32) -> T {
        let var = LocalVar::decode(encoded);
        debug_assert_eq!(var.mode(), AddressMode::Value, "scalar read of address operand");
        unsafe { (self.slot(var) as *const T).read_unaligned() }
    }

    /// Resolves a pointer operand: address mode yields the slot's own
    /// address, value mode reads the pointer stored in the slot.
    #[inline]
    fn pointer(&self, encoded: u32) -> *mut u8 {
        let var = LocalVar::decode(encoded);
        match var.mode() {
            AddressMode::Address => self.slot(var),
            AddressMode::Value => unsafe {
                (self.slot(var) as *const usize).read_unaligned() as *mut u8
            },
        }
    }
}

/// Re-enters the interpreter for a runtime callback. Each argument is one
/// 8-byte value (a pointer or a pointer-sized scalar) written into the
/// callee's parameter slots in order. Callback failures are programming
/// errors and abort the query.
fn call_raw(module: &Arc<Module>, func_id: u16, args: &[u64]) {
    let func = module.function(func_id).expect("validated function id");
    debug_assert_eq!(func.params.len(), args.len());
    let mut buf = vec![0u8; func.params_size];
    for (value, param) in args.iter().zip(&func.params) {
        let bytes = value.to_le_bytes();
        let size = (param.size as usize).min(8);
        let start = param.offset as usize - func.params_start_pos;
        buf[start..start + size].copy_from_slice(&bytes[..size]);
    }
    VM::invoke(module, func_id, &buf).expect("runtime callback failed");
}

/// The virtual machine: a dispatch loop over one module's bytecode.
pub struct VM {
    module: Arc<Module>,
}

impl VM {
    /// Invokes `func_id` with `args` laid out per the function's parameter
    /// locals: by-address parameters hold raw 8-byte pointers, by-value
    /// parameters hold their pointee bytes.
    pub fn invoke(module: &Arc<Module>, func_id: u16, args: &[u8]) -> Result<(), ExecError> {
        let func = module
            .function(func_id)
            .ok_or(ExecError::UnknownFunction(func_id))?;
        if args.len() != func.params_size {
            return Err(ExecError::BadArgumentSize {
                expected: func.params_size,
                actual: args.len(),
            });
        }
        debug!(function = %func.name, frame = func.frame_size, "invoke");

        let vm = VM {
            module: Arc::clone(module),
        };
        let start = func.bytecode_range.start;
        let frame_size = func.frame_size;
        let params_start = func.params_start_pos;
        with_frame(frame_size, |data| {
            unsafe {
                std::ptr::copy_nonoverlapping(args.as_ptr(), data.add(params_start), args.len());
            }
            vm.interpret(start, &Frame { data, size: frame_size })
        })
    }

    /// Looks a function up by name and invokes it.
    pub fn invoke_by_name(module: &Arc<Module>, name: &str, args: &[u8]) -> Result<(), ExecError> {
        let (id, _) = module
            .function_by_name(name)
            .ok_or_else(|| ExecError::FunctionNotFound(name.to_string()))?;
        Self::invoke(module, id, args)
    }

    fn interpret(&self, start: usize, frame: &Frame) -> Result<(), ExecError> {
        let code = self.module.bytecode();
        let mut ip = start;

        macro_rules! read_u8 {
            () => {{
                let v = code[ip];
                ip += 1;
                v
            }};
        }
        macro_rules! read_u16 {
            () => {{
                let v = u16::from_le_bytes(code[ip..ip + 2].try_into().unwrap());
                ip += 2;
                v
            }};
        }
        macro_rules! read_u32 {
            () => {{
                let v = u32::from_le_bytes(code[ip..ip + 4].try_into().unwrap());
                ip += 4;
                v
            }};
        }
        macro_rules! read_u64 {
            () => {{
                let v = u64::from_le_bytes(code[ip..ip + 8].try_into().unwrap());
                ip += 8;
                v
            }};
        }

        macro_rules! bin_arith {
            ($ty:ty, $method:ident) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let lhs: $ty = frame.scalar(read_u32!());
                let rhs: $ty = frame.scalar(read_u32!());
                unsafe { dest.write_unaligned(lhs.$method(rhs)) };
            }};
        }
        // Division and remainder signal a zero divisor by leaving the
        // destination untouched; execution continues.
        macro_rules! bin_div {
            ($ty:ty, $method:ident) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let lhs: $ty = frame.scalar(read_u32!());
                let rhs: $ty = frame.scalar(read_u32!());
                if rhs == 0 {
                    warn!("division by zero in bytecode; destination unchanged");
                } else {
                    unsafe { dest.write_unaligned(lhs.$method(rhs)) };
                }
            }};
        }
        macro_rules! bin_bit {
            ($ty:ty, $op:tt) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let lhs: $ty = frame.scalar(read_u32!());
                let rhs: $ty = frame.scalar(read_u32!());
                unsafe { dest.write_unaligned(lhs $op rhs) };
            }};
        }
        macro_rules! un_arith {
            ($ty:ty, $method:ident) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let input: $ty = frame.scalar(read_u32!());
                unsafe { dest.write_unaligned(input.$method()) };
            }};
        }
        macro_rules! un_bitneg {
            ($ty:ty) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let input: $ty = frame.scalar(read_u32!());
                unsafe { dest.write_unaligned(!input) };
            }};
        }
        macro_rules! bin_cmp {
            ($ty:ty, $op:tt) => {{
                let dest = frame.pointer(read_u32!());
                let lhs: $ty = frame.scalar(read_u32!());
                let rhs: $ty = frame.scalar(read_u32!());
                unsafe { dest.write((lhs $op rhs) as u8) };
            }};
        }
        macro_rules! bin_float {
            ($ty:ty, $op:tt) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let lhs: $ty = frame.scalar(read_u32!());
                let rhs: $ty = frame.scalar(read_u32!());
                unsafe { dest.write_unaligned(lhs $op rhs) };
            }};
        }
        macro_rules! deref_sized {
            ($ty:ty) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let src = frame.pointer(read_u32!()) as *const $ty;
                unsafe { dest.write_unaligned(src.read_unaligned()) };
            }};
        }
        macro_rules! assign_sized {
            ($ty:ty) => {{
                let dest = frame.pointer(read_u32!()) as *mut $ty;
                let value: $ty = frame.scalar(read_u32!());
                unsafe { dest.write_unaligned(value) };
            }};
        }

        use Bytecode::*;
        loop {
            let op = Bytecode::from_u16(u16::from_le_bytes(code[ip..ip + 2].try_into().unwrap()))
                .expect("validated opcode");
            ip += 2;

            match op {
                AddI8 => bin_arith!(i8, wrapping_add),
                AddI16 => bin_arith!(i16, wrapping_add),
                AddI32 => bin_arith!(i32, wrapping_add),
                AddI64 => bin_arith!(i64, wrapping_add),
                AddU8 => bin_arith!(u8, wrapping_add),
                AddU16 => bin_arith!(u16, wrapping_add),
                AddU32 => bin_arith!(u32, wrapping_add),
                AddU64 => bin_arith!(u64, wrapping_add),
                SubI8 => bin_arith!(i8, wrapping_sub),
                SubI16 => bin_arith!(i16, wrapping_sub),
                SubI32 => bin_arith!(i32, wrapping_sub),
                SubI64 => bin_arith!(i64, wrapping_sub),
                SubU8 => bin_arith!(u8, wrapping_sub),
                SubU16 => bin_arith!(u16, wrapping_sub),
                SubU32 => bin_arith!(u32, wrapping_sub),
                SubU64 => bin_arith!(u64, wrapping_sub),
                MulI8 => bin_arith!(i8, wrapping_mul),
                MulI16 => bin_arith!(i16, wrapping_mul),
                MulI32 => bin_arith!(i32, wrapping_mul),
                MulI64 => bin_arith!(i64, wrapping_mul),
                MulU8 => bin_arith!(u8, wrapping_mul),
                MulU16 => bin_arith!(u16, wrapping_mul),
                MulU32 => bin_arith!(u32, wrapping_mul),
                MulU64 => bin_arith!(u64, wrapping_mul),
                DivI8 => bin_div!(i8, wrapping_div),
                DivI16 => bin_div!(i16, wrapping_div),
                DivI32 => bin_div!(i32, wrapping_div),
                DivI64 => bin_div!(i64, wrapping_div),
                DivU8 => bin_div!(u8, wrapping_div),
                DivU16 => bin_div!(u16, wrapping_div),
                DivU32 => bin_div!(u32, wrapping_div),
                DivU64 => bin_div!(u64, wrapping_div),
                RemI8 => bin_div!(i8, wrapping_rem),
                RemI16 => bin_div!(i16, wrapping_rem),
                RemI32 => bin_div!(i32, wrapping_rem),
                RemI64 => bin_div!(i64, wrapping_rem),
                RemU8 => bin_div!(u8, wrapping_rem),
                RemU16 => bin_div!(u16, wrapping_rem),
                RemU32 => bin_div!(u32, wrapping_rem),
                RemU64 => bin_div!(u64, wrapping_rem),
                BitAndI8 => bin_bit!(i8, &),
                BitAndI16 => bin_bit!(i16, &),
                BitAndI32 => bin_bit!(i32, &),
                BitAndI64 => bin_bit!(i64, &),
                BitAndU8 => bin_bit!(u8, &),
                BitAndU16 => bin_bit!(u16, &),
                BitAndU32 => bin_bit!(u32, &),
                BitAndU64 => bin_bit!(u64, &),
                BitOrI8 => bin_bit!(i8, |),
                BitOrI16 => bin_bit!(i16, |),
                BitOrI32 => bin_bit!(i32, |),
                BitOrI64 => bin_bit!(i64, |),
                BitOrU8 => bin_bit!(u8, |),
                BitOrU16 => bin_bit!(u16, |),
                BitOrU32 => bin_bit!(u32, |),
                BitOrU64 => bin_bit!(u64, |),
                BitXorI8 => bin_bit!(i8, ^),
                BitXorI16 => bin_bit!(i16, ^),
                BitXorI32 => bin_bit!(i32, ^),
                BitXorI64 => bin_bit!(i64, ^),
                BitXorU8 => bin_bit!(u8, ^),
                BitXorU16 => bin_bit!(u16, ^),
                BitXorU32 => bin_bit!(u32, ^),
                BitXorU64 => bin_bit!(u64, ^),

                NegI8 => un_arith!(i8, wrapping_neg),
                NegI16 => un_arith!(i16, wrapping_neg),
                NegI32 => un_arith!(i32, wrapping_neg),
                NegI64 => un_arith!(i64, wrapping_neg),
                NegU8 => un_arith!(u8, wrapping_neg),
                NegU16 => un_arith!(u16, wrapping_neg),
                NegU32 => un_arith!(u32, wrapping_neg),
                NegU64 => un_arith!(u64, wrapping_neg),
                BitNegI8 => un_bitneg!(i8),
                BitNegI16 => un_bitneg!(i16),
                BitNegI32 => un_bitneg!(i32),
                BitNegI64 => un_bitneg!(i64),
                BitNegU8 => un_bitneg!(u8),
                BitNegU16 => un_bitneg!(u16),
                BitNegU32 => un_bitneg!(u32),
                BitNegU64 => un_bitneg!(u64),

                EqualI8 => bin_cmp!(i8, ==),
                EqualI16 => bin_cmp!(i16, ==),
                EqualI32 => bin_cmp!(i32, ==),
                EqualI64 => bin_cmp!(i64, ==),
                EqualU8 => bin_cmp!(u8, ==),
                EqualU16 => bin_cmp!(u16, ==),
                EqualU32 => bin_cmp!(u32, ==),
                EqualU64 => bin_cmp!(u64, ==),
                NotEqualI8 => bin_cmp!(i8, !=),
                NotEqualI16 => bin_cmp!(i16, !=),
                NotEqualI32 => bin_cmp!(i32, !=),
                NotEqualI64 => bin_cmp!(i64, !=),
                NotEqualU8 => bin_cmp!(u8, !=),
                NotEqualU16 => bin_cmp!(u16, !=),
                NotEqualU32 => bin_cmp!(u32, !=),
                NotEqualU64 => bin_cmp!(u64, !=),
                LessThanI8 => bin_cmp!(i8, <),
                LessThanI16 => bin_cmp!(i16, <),
                LessThanI32 => bin_cmp!(i32, <),
                LessThanI64 => bin_cmp!(i64, <),
                LessThanU8 => bin_cmp!(u8, <),
                LessThanU16 => bin_cmp!(u16, <),
                LessThanU32 => bin_cmp!(u32, <),
                LessThanU64 => bin_cmp!(u64, <),
                LessThanEqualI8 => bin_cmp!(i8, <=),
                LessThanEqualI16 => bin_cmp!(i16, <=),
                LessThanEqualI32 => bin_cmp!(i32, <=),
                LessThanEqualI64 => bin_cmp!(i64, <=),
                LessThanEqualU8 => bin_cmp!(u8, <=),
                LessThanEqualU16 => bin_cmp!(u16, <=),
                LessThanEqualU32 => bin_cmp!(u32, <=),
                LessThanEqualU64 => bin_cmp!(u64, <=),
                GreaterThanI8 => bin_cmp!(i8, >),
                GreaterThanI16 => bin_cmp!(i16, >),
                GreaterThanI32 => bin_cmp!(i32, >),
                GreaterThanI64 => bin_cmp!(i64, >),
                GreaterThanU8 => bin_cmp!(u8, >),
                GreaterThanU16 => bin_cmp!(u16, >),
                GreaterThanU32 => bin_cmp!(u32, >),
                GreaterThanU64 => bin_cmp!(u64, >),
                GreaterThanEqualI8 => bin_cmp!(i8, >=),
                GreaterThanEqualI16 => bin_cmp!(i16, >=),
                GreaterThanEqualI32 => bin_cmp!(i32, >=),
                GreaterThanEqualI64 => bin_cmp!(i64, >=),
                GreaterThanEqualU8 => bin_cmp!(u8, >=),
                GreaterThanEqualU16 => bin_cmp!(u16, >=),
                GreaterThanEqualU32 => bin_cmp!(u32, >=),
                GreaterThanEqualU64 => bin_cmp!(u64, >=),

                AddF32 => bin_float!(f32, +),
                AddF64 => bin_float!(f64, +),
                SubF32 => bin_float!(f32, -),
                SubF64 => bin_float!(f64, -),
                MulF32 => bin_float!(f32, *),
                MulF64 => bin_float!(f64, *),
                DivF32 => bin_float!(f32, /),
                DivF64 => bin_float!(f64, /),

                Not => {
                    let dest = frame.pointer(read_u32!());
                    let input: u8 = frame.scalar(read_u32!());
                    unsafe { dest.write((input == 0) as u8) };
                }

                // Jump offsets are measured from the start of the offset
                // operand; an offset of zero would loop forever.
                Jump => {
                    let operand_pos = ip;
                    let offset = read_u32!() as i32;
                    ip = (operand_pos as i64 + i64::from(offset)) as usize;
                }
                JumpIfTrue => {
                    let cond: u8 = frame.scalar(read_u32!());
                    let operand_pos = ip;
                    let offset = read_u32!() as i32;
                    if cond != 0 {
                        ip = (operand_pos as i64 + i64::from(offset)) as usize;
                    }
                }
                JumpIfFalse => {
                    let cond: u8 = frame.scalar(read_u32!());
                    let operand_pos = ip;
                    let offset = read_u32!() as i32;
                    if cond == 0 {
                        ip = (operand_pos as i64 + i64::from(offset)) as usize;
                    }
                }

                IsNullPtr => {
                    let dest = frame.pointer(read_u32!());
                    let input = frame.pointer(read_u32!());
                    unsafe { dest.write(input.is_null() as u8) };
                }
                IsNotNullPtr => {
                    let dest = frame.pointer(read_u32!());
                    let input = frame.pointer(read_u32!());
                    unsafe { dest.write(!input.is_null() as u8) };
                }

                Deref1 => deref_sized!(u8),
                Deref2 => deref_sized!(u16),
                Deref4 => deref_sized!(u32),
                Deref8 => deref_sized!(u64),
                DerefN => {
                    let dest = frame.pointer(read_u32!());
                    let src = frame.pointer(read_u32!());
                    let len = read_u32!() as usize;
                    unsafe { std::ptr::copy(src, dest, len) };
                }
                Assign1 => assign_sized!(u8),
                Assign2 => assign_sized!(u16),
                Assign4 => assign_sized!(u32),
                Assign8 => assign_sized!(u64),
                AssignImm1 => {
                    let dest = frame.pointer(read_u32!());
                    let value = read_u8!();
                    unsafe { dest.write(value) };
                }
                AssignImm2 => {
                    let dest = frame.pointer(read_u32!()) as *mut u16;
                    let value = read_u16!();
                    unsafe { dest.write_unaligned(value) };
                }
                AssignImm4 => {
                    let dest = frame.pointer(read_u32!()) as *mut u32;
                    let value = read_u32!();
                    unsafe { dest.write_unaligned(value) };
                }
                AssignImm8 => {
                    let dest = frame.pointer(read_u32!()) as *mut u64;
                    let value = read_u64!();
                    unsafe { dest.write_unaligned(value) };
                }
                Lea => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let base = frame.pointer(read_u32!());
                    let offset = read_u32!() as i32;
                    unsafe { dest.write_unaligned((base as i64 + i64::from(offset)) as usize) };
                }
                LeaScaled => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let base = frame.pointer(read_u32!());
                    let index: u64 = frame.scalar(read_u32!());
                    let scale = read_u32!() as i32;
                    let offset = read_u32!() as i32;
                    let address =
                        base as i64 + index as i64 * i64::from(scale) + i64::from(offset);
                    unsafe { dest.write_unaligned(address as usize) };
                }

                Call => {
                    ip = self.execute_call(ip, frame)?;
                }
                Return => return Ok(()),

                // ---- native bridges ----

                VPIHasNext => {
                    let dest = frame.pointer(read_u32!());
                    let vpi = frame.pointer(read_u32!()) as *mut VectorProjectionIterator<'static>;
                    unsafe { dest.write((*vpi).has_next() as u8) };
                }
                VPIAdvance => {
                    let vpi = frame.pointer(read_u32!()) as *mut VectorProjectionIterator<'static>;
                    unsafe { (*vpi).advance() };
                }
                VPIReset => {
                    let vpi = frame.pointer(read_u32!()) as *mut VectorProjectionIterator<'static>;
                    unsafe { (*vpi).reset() };
                }
                VPISetPosition => {
                    let vpi = frame.pointer(read_u32!()) as *mut VectorProjectionIterator<'static>;
                    let position: u64 = frame.scalar(read_u32!());
                    unsafe { (*vpi).set_position(position as usize) };
                }
                VPIGetTinyInt => self.vpi_get::<i8>(frame, &mut ip, code),
                VPIGetSmallInt => self.vpi_get::<i16>(frame, &mut ip, code),
                VPIGetInteger => self.vpi_get::<i32>(frame, &mut ip, code),
                VPIGetBigInt => self.vpi_get::<i64>(frame, &mut ip, code),
                VPIGetFloat => self.vpi_get::<f32>(frame, &mut ip, code),
                VPIGetDouble => self.vpi_get::<f64>(frame, &mut ip, code),
                VPIIsNull => {
                    let dest = frame.pointer(read_u32!());
                    let vpi = frame.pointer(read_u32!()) as *mut VectorProjectionIterator<'static>;
                    let col = read_u32!() as usize;
                    unsafe { dest.write((*vpi).is_null(col) as u8) };
                }

                HashInt => {
                    let dest = frame.pointer(read_u32!()) as *mut u64;
                    let value: i64 = frame.scalar(read_u32!());
                    unsafe { dest.write_unaligned(ops::hash_scalar(&value)) };
                }
                HashDouble => {
                    let dest = frame.pointer(read_u32!()) as *mut u64;
                    let value: f64 = frame.scalar(read_u32!());
                    unsafe { dest.write_unaligned(ops::hash_scalar(&value.to_bits())) };
                }
                HashCombine => {
                    let dest = frame.pointer(read_u32!()) as *mut u64;
                    let value: u64 = frame.scalar(read_u32!());
                    unsafe { dest.write_unaligned(ops::hash::combine(dest.read_unaligned(), value)) };
                }

                AggHashTableInit => {
                    let agg = frame.pointer(read_u32!()) as *mut AggregationHashTable;
                    let payload_size = read_u32!() as usize;
                    unsafe { agg.write(AggregationHashTable::new(payload_size)) };
                }
                AggHashTableInsert => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let agg = frame.pointer(read_u32!()) as *mut AggregationHashTable;
                    let hash: u64 = frame.scalar(read_u32!());
                    let payload = unsafe { (*agg).insert(hash) };
                    unsafe { dest.write_unaligned(payload as usize) };
                }
                AggHashTableInsertPartitioned => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let agg = frame.pointer(read_u32!()) as *mut AggregationHashTable;
                    let hash: u64 = frame.scalar(read_u32!());
                    let payload = unsafe { (*agg).insert_partitioned(hash) };
                    unsafe { dest.write_unaligned(payload as usize) };
                }
                AggHashTableProcessBatch => {
                    let agg = frame.pointer(read_u32!()) as *mut AggregationHashTable;
                    let vpi = frame.pointer(read_u32!()) as *mut VectorProjectionIterator<'static>;
                    let hash_fid = read_u16!();
                    let key_eq_fid = read_u16!();
                    let init_fid = read_u16!();
                    let advance_fid = read_u16!();
                    let partitioned = read_u8!() != 0;

                    let module = &self.module;
                    let hash_fn = |v: &VectorProjectionIterator<'_>| -> u64 {
                        let mut ret: u64 = 0;
                        call_raw(
                            module,
                            hash_fid,
                            &[&mut ret as *mut u64 as u64, v as *const _ as u64],
                        );
                        ret
                    };
                    let key_eq = |payload: *const u8, v: &VectorProjectionIterator<'_>| -> bool {
                        let mut ret: u8 = 0;
                        call_raw(
                            module,
                            key_eq_fid,
                            &[&mut ret as *mut u8 as u64, payload as u64, v as *const _ as u64],
                        );
                        ret != 0
                    };
                    let mut init_agg = |payload: *mut u8, v: &VectorProjectionIterator<'_>| {
                        call_raw(module, init_fid, &[payload as u64, v as *const _ as u64]);
                    };
                    let mut advance_agg = |payload: *mut u8, v: &VectorProjectionIterator<'_>| {
                        call_raw(module, advance_fid, &[payload as u64, v as *const _ as u64]);
                    };

                    unsafe {
                        (*agg).process_batch(
                            &mut *vpi,
                            &hash_fn,
                            &key_eq,
                            &mut init_agg,
                            &mut advance_agg,
                            partitioned,
                        );
                    }
                }
                AggHashTableTransferPartitions => {
                    let agg = frame.pointer(read_u32!()) as *mut AggregationHashTable;
                    let tsc = frame.pointer(read_u32!()) as *mut ThreadStateContainer<'static>;
                    let offset = read_u32!() as usize;
                    unsafe { (*agg).transfer_partitions(&*tsc, offset) };
                }
                AggHashTableParallelScan => {
                    let agg = frame.pointer(read_u32!()) as *mut AggregationHashTable;
                    let ctx = frame.pointer(read_u32!()) as *mut ExecutionContext;
                    let key_eq_fid = read_u16!();
                    let merge_fid = read_u16!();
                    let scan_fid = read_u16!();

                    let module = &self.module;
                    let key_eq = move |left: *const u8, right: *const u8| -> bool {
                        let mut ret: u8 = 0;
                        call_raw(
                            module,
                            key_eq_fid,
                            &[&mut ret as *mut u8 as u64, left as u64, right as u64],
                        );
                        ret != 0
                    };
                    let merge = move |dst: *mut u8, src: *const u8| {
                        call_raw(module, merge_fid, &[dst as u64, src as u64]);
                    };
                    let scan = move |payload: *const u8| {
                        call_raw(module, scan_fid, &[payload as u64]);
                    };
                    unsafe {
                        let pool = Arc::clone(&(*ctx).pool);
                        (*agg).parallel_partitioned_scan(&pool, &key_eq, &merge, &scan);
                    }
                }
                AggHashTableFree => {
                    let agg = frame.pointer(read_u32!()) as *mut AggregationHashTable;
                    unsafe { std::ptr::drop_in_place(agg) };
                }

                JoinHashTableInit => {
                    let jht = frame.pointer(read_u32!()) as *mut JoinHashTable;
                    let tuple_size = read_u32!() as usize;
                    let use_concise = read_u8!() != 0;
                    unsafe { jht.write(JoinHashTable::new(tuple_size, use_concise)) };
                }
                JoinHashTableAllocTuple => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let jht = frame.pointer(read_u32!()) as *mut JoinHashTable;
                    let hash: u64 = frame.scalar(read_u32!());
                    let payload = unsafe { (*jht).alloc_input_tuple(hash) };
                    unsafe { dest.write_unaligned(payload as usize) };
                }
                JoinHashTableBuild => {
                    let jht = frame.pointer(read_u32!()) as *mut JoinHashTable;
                    unsafe { (*jht).build() };
                }
                JoinHashTableBuildParallel => {
                    let jht = frame.pointer(read_u32!()) as *mut JoinHashTable;
                    let tsc = frame.pointer(read_u32!()) as *mut ThreadStateContainer<'static>;
                    let offset = read_u32!() as usize;
                    let ctx = frame.pointer(read_u32!()) as *mut ExecutionContext;
                    unsafe {
                        let pool = Arc::clone(&(*ctx).pool);
                        (*jht).merge_parallel(&*tsc, offset, &pool);
                    }
                }
                JoinHashTableFree => {
                    let jht = frame.pointer(read_u32!()) as *mut JoinHashTable;
                    unsafe { std::ptr::drop_in_place(jht) };
                }

                SorterInit => {
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    let cmp_fid = read_u16!();
                    let tuple_size = read_u32!() as usize;
                    let module = Arc::clone(&self.module);
                    let cmp: CompareFn = Arc::new(move |left, right| {
                        let mut ret: i32 = 0;
                        call_raw(
                            &module,
                            cmp_fid,
                            &[&mut ret as *mut i32 as u64, left as u64, right as u64],
                        );
                        ret.cmp(&0)
                    });
                    unsafe { sorter.write(Sorter::new(cmp, tuple_size)) };
                }
                SorterAllocTuple => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    let tuple = unsafe { (*sorter).alloc_input_tuple() };
                    unsafe { dest.write_unaligned(tuple as usize) };
                }
                SorterAllocTupleTopK => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    let top_k = read_u32!() as usize;
                    let tuple = unsafe { (*sorter).alloc_input_tuple_top_k(top_k) };
                    unsafe { dest.write_unaligned(tuple as usize) };
                }
                SorterAllocTupleTopKFinish => {
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    let top_k = read_u32!() as usize;
                    unsafe { (*sorter).alloc_input_tuple_top_k_finish(top_k) };
                }
                SorterSort => {
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    unsafe { (*sorter).sort() };
                }
                SorterSortParallel => {
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    let tsc = frame.pointer(read_u32!()) as *mut ThreadStateContainer<'static>;
                    let offset = read_u32!() as usize;
                    let ctx = frame.pointer(read_u32!()) as *mut ExecutionContext;
                    unsafe {
                        let pool = Arc::clone(&(*ctx).pool);
                        (*sorter).sort_parallel(&*tsc, offset, &pool);
                    }
                }
                SorterSortTopKParallel => {
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    let tsc = frame.pointer(read_u32!()) as *mut ThreadStateContainer<'static>;
                    let offset = read_u32!() as usize;
                    let top_k = read_u32!() as usize;
                    let ctx = frame.pointer(read_u32!()) as *mut ExecutionContext;
                    unsafe {
                        let pool = Arc::clone(&(*ctx).pool);
                        (*sorter).sort_top_k_parallel(&*tsc, offset, top_k, &pool);
                    }
                }
                SorterFree => {
                    let sorter = frame.pointer(read_u32!()) as *mut Sorter;
                    unsafe { std::ptr::drop_in_place(sorter) };
                }

                ThreadStateContainerReset => {
                    let tsc = frame.pointer(read_u32!()) as *mut ThreadStateContainer<'static>;
                    let slot_size = read_u32!() as usize;
                    let init_fid = read_u16!();
                    let destroy_fid = read_u16!();
                    let opaque_ctx = frame.pointer(read_u32!()) as usize;

                    let num_threads = std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1);
                    let init = (init_fid != u16::MAX).then(|| {
                        let module = Arc::clone(&self.module);
                        let f: Box<dyn Fn(*mut u8) + Send + Sync> = Box::new(move |slot| {
                            call_raw(&module, init_fid, &[opaque_ctx as u64, slot as u64]);
                        });
                        f
                    });
                    let destroy = (destroy_fid != u16::MAX).then(|| {
                        let module = Arc::clone(&self.module);
                        let f: Box<dyn Fn(*mut u8) + Send + Sync> = Box::new(move |slot| {
                            call_raw(&module, destroy_fid, &[opaque_ctx as u64, slot as u64]);
                        });
                        f
                    });
                    unsafe { (*tsc).reset(num_threads, slot_size, init, destroy) };
                }
                ThreadStateContainerIterate => {
                    let tsc = frame.pointer(read_u32!()) as *mut ThreadStateContainer<'static>;
                    let opaque_ctx = frame.pointer(read_u32!()) as usize;
                    let iterate_fid = read_u16!();
                    unsafe {
                        (*tsc).for_each_slot(|slot| {
                            call_raw(&self.module, iterate_fid, &[opaque_ctx as u64, slot as u64]);
                        });
                    }
                }
                ThreadStateContainerClear => {
                    let tsc = frame.pointer(read_u32!()) as *mut ThreadStateContainer<'static>;
                    unsafe { (*tsc).clear() };
                }

                ExecutionContextGetTLS => {
                    let dest = frame.pointer(read_u32!()) as *mut usize;
                    let ctx = frame.pointer(read_u32!()) as *mut ExecutionContext;
                    let tsc = unsafe { &mut (*ctx).thread_states as *mut ThreadStateContainer<'static> };
                    unsafe { dest.write_unaligned(tsc as usize) };
                }
            }
        }
    }

    /// Implements `Call`: reads the callee id and argument locals, lays out
    /// the callee frame, copies arguments per the by-value/by-address
    /// convention, and re-enters the interpreter. Returns the resume ip.
    fn execute_call(&self, mut ip: usize, caller: &Frame) -> Result<usize, ExecError> {
        let code = self.module.bytecode();
        let func_id = u16::from_le_bytes(code[ip..ip + 2].try_into().unwrap());
        ip += 2;
        let num_params = u16::from_le_bytes(code[ip..ip + 2].try_into().unwrap()) as usize;
        ip += 2;

        let func = self
            .module
            .function(func_id)
            .ok_or(ExecError::UnknownFunction(func_id))?;

        let mut arg_vars = Vec::with_capacity(num_params);
        for _ in 0..num_params {
            let encoded = u32::from_le_bytes(code[ip..ip + 4].try_into().unwrap());
            ip += 4;
            arg_vars.push(LocalVar::decode(encoded));
        }

        let start = func.bytecode_range.start;
        let frame_size = func.frame_size;
        let params = func.params.clone();
        with_frame(frame_size, |data| {
            for (var, param) in arg_vars.iter().zip(&params) {
                let src = caller.slot(LocalVar::value(var.offset()));
                unsafe {
                    match var.mode() {
                        // By-address: the parameter slot receives the
                        // caller slot's address.
                        AddressMode::Address => {
                            let address = src as usize;
                            std::ptr::copy_nonoverlapping(
                                &address as *const usize as *const u8,
                                data.add(param.offset as usize),
                                (param.size as usize).min(8),
                            );
                        }
                        // By-value: the pointee bytes are copied.
                        AddressMode::Value => {
                            std::ptr::copy_nonoverlapping(
                                src,
                                data.add(param.offset as usize),
                                param.size as usize,
                            );
                        }
                    }
                }
            }
            self.interpret(start, &Frame { data, size: frame_size })
        })?;

        Ok(ip)
    }

    /// Shared body of the typed VPI read bridges.
    fn vpi_get<T: crate::exec::vector::Elem>(&self, frame: &Frame, ip: &mut usize, code: &[u8]) {
        let dest = frame.pointer(read_u32_at(code, ip)) as *mut T;
        let vpi = frame.pointer(read_u32_at(code, ip)) as *mut VectorProjectionIterator<'static>;
        let col = read_u32_at(code, ip) as usize;
        unsafe { dest.write_unaligned((*vpi).get::<T>(col)) };
    }
}

#[inline]
fn read_u32_at(code: &[u8], ip: &mut usize) -> u32 {
    let value = u32::from_le_bytes(code[*ip..*ip + 4].try_into().unwrap());
    *ip += 4;
    value
}
