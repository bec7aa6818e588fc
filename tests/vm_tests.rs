//! Interpreter behavior: arithmetic, control flow, the calling convention,
//! division-by-zero signalling, and the native sorter bridge with a
//! bytecode comparator.

use std::sync::Arc;

use kestrel::exec::Sorter;
use kestrel::vm::{Bytecode, ModuleBuilder, VM};

/// Helper: packs pointer arguments for an invocation.
fn pack_ptrs(ptrs: &[usize]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ptrs.len() * 8);
    for &ptr in ptrs {
        out.extend_from_slice(&ptr.to_le_bytes());
    }
    out
}

#[test]
fn arithmetic_and_out_pointer_return() {
    // fn compute(ret: *i64) { *ret = (7 + 5) * 3 }
    let mut mb = ModuleBuilder::new();
    mb.build_function("compute", |f| {
        let ret = f.new_param(8, 8);
        let a = f.new_local(8, 8);
        let b = f.new_local(8, 8);
        let tmp = f.new_local(8, 8);
        f.emit_assign_imm8(a, 7);
        f.emit_assign_imm8(b, 5);
        f.emit_binary(Bytecode::AddI64, tmp, a, b);
        f.emit_assign_imm8(b, 3);
        f.emit_binary(Bytecode::MulI64, tmp, tmp, b);
        // Store through the out-pointer param: value-mode dest reads the
        // pointer stored in the slot.
        f.emit_op(Bytecode::Assign8);
        f.emit_local(ret);
        f.emit_local(tmp);
        f.emit_return();
    });
    let module = Arc::new(mb.finish().unwrap());

    let mut result: i64 = 0;
    VM::invoke_by_name(&module, "compute", &pack_ptrs(&[&mut result as *mut i64 as usize]))
        .unwrap();
    assert_eq!(result, 36);
}

#[test]
fn division_by_zero_does_not_abort() {
    // fn guarded(ret: *i32) { x = 10; y = 0; x = x / y; *ret = 77 }
    let mut mb = ModuleBuilder::new();
    mb.build_function("guarded", |f| {
        let ret = f.new_param(8, 8);
        let x = f.new_local(4, 4);
        let y = f.new_local(4, 4);
        f.emit_assign_imm4(x, 10);
        f.emit_assign_imm4(y, 0);
        f.emit_binary(Bytecode::DivI32, x, x, y);
        // Execution continues past the fault; x keeps its prior value.
        f.emit_op(Bytecode::Assign4);
        f.emit_local(ret);
        f.emit_local(x);
        f.emit_return();
    });
    let module = Arc::new(mb.finish().unwrap());

    let mut result: i32 = -1;
    VM::invoke_by_name(&module, "guarded", &pack_ptrs(&[&mut result as *mut i32 as usize]))
        .unwrap();
    assert_eq!(result, 10);
}

#[test]
fn backward_jump_loops_and_conditionals_terminate() {
    // fn sum_to_ten(ret: *i64) { total = 0; i = 0;
    //   loop: if !(i < 10) break; total += i; i += 1; goto loop; *ret = total }
    let mut mb = ModuleBuilder::new();
    mb.build_function("sum_to_ten", |f| {
        let ret = f.new_param(8, 8);
        let total = f.new_local(8, 8);
        let i = f.new_local(8, 8);
        let limit = f.new_local(8, 8);
        let one = f.new_local(8, 8);
        let cond = f.new_local(1, 1);

        f.emit_assign_imm8(total, 0);
        f.emit_assign_imm8(i, 0);
        f.emit_assign_imm8(limit, 10);
        f.emit_assign_imm8(one, 1);

        let loop_head = f.create_label();
        let done = f.create_label();
        f.bind_label(loop_head);
        f.emit_binary(Bytecode::LessThanI64, cond, i, limit);
        f.emit_jump_if_false(cond, done);
        f.emit_binary(Bytecode::AddI64, total, total, i);
        f.emit_binary(Bytecode::AddI64, i, i, one);
        f.emit_jump(loop_head);
        f.bind_label(done);

        f.emit_op(Bytecode::Assign8);
        f.emit_local(ret);
        f.emit_local(total);
        f.emit_return();
    });
    let module = Arc::new(mb.finish().unwrap());

    let mut result: i64 = 0;
    VM::invoke_by_name(&module, "sum_to_ten", &pack_ptrs(&[&mut result as *mut i64 as usize]))
        .unwrap();
    assert_eq!(result, 45);
}

#[test]
fn call_passes_by_value_and_by_address() {
    let mut mb = ModuleBuilder::new();

    // fn double_into(out: *i64, value: i64) { *out = value + value }
    let double_id = mb.declare_function("double_into");
    let mut f = mb.function_builder(double_id);
    let out = f.new_param(8, 8);
    let value = f.new_param(8, 8);
    let tmp = f.new_local(8, 8);
    f.emit_binary(Bytecode::AddI64, tmp, value, value);
    f.emit_op(Bytecode::Assign8);
    f.emit_local(out);
    f.emit_local(tmp);
    f.emit_return();
    mb.define_function(double_id, f);

    // fn main_fn(ret: *i64) { local = 21; double_into(&result_slot, local); *ret = result_slot }
    let main_id = mb.declare_function("main_fn");
    let mut f = mb.function_builder(main_id);
    let ret = f.new_param(8, 8);
    let local = f.new_local(8, 8);
    let result_slot = f.new_local(8, 8);
    f.emit_assign_imm8(local, 21);
    // result_slot by address, local by value.
    f.emit_call(double_id, &[result_slot.as_address(), local]);
    f.emit_op(Bytecode::Assign8);
    f.emit_local(ret);
    f.emit_local(result_slot);
    f.emit_return();
    mb.define_function(main_id, f);

    let module = Arc::new(mb.finish().unwrap());
    let mut result: i64 = 0;
    VM::invoke_by_name(&module, "main_fn", &pack_ptrs(&[&mut result as *mut i64 as usize]))
        .unwrap();
    assert_eq!(result, 42);
}

#[test]
fn deterministic_across_invocations() {
    let mut mb = ModuleBuilder::new();
    mb.build_function("mix", |f| {
        let ret = f.new_param(8, 8);
        let a = f.new_local(8, 8);
        let b = f.new_local(8, 8);
        f.emit_assign_imm8(a, 0x1234_5678);
        f.emit_assign_imm8(b, 0x0f0f_0f0f);
        f.emit_binary(Bytecode::BitXorI64, a, a, b);
        f.emit_binary(Bytecode::MulI64, a, a, b);
        f.emit_op(Bytecode::Assign8);
        f.emit_local(ret);
        f.emit_local(a);
        f.emit_return();
    });
    let module = Arc::new(mb.finish().unwrap());

    let mut first: i64 = 0;
    let mut second: i64 = 0;
    VM::invoke_by_name(&module, "mix", &pack_ptrs(&[&mut first as *mut i64 as usize])).unwrap();
    VM::invoke_by_name(&module, "mix", &pack_ptrs(&[&mut second as *mut i64 as usize])).unwrap();
    assert_eq!(first, second);
}

#[test]
fn sorter_bridge_uses_bytecode_comparator() {
    let mut mb = ModuleBuilder::new();

    // fn cmp(ret: *i32, left: *i64, right: *i64) {
    //   l = *left; r = *right;
    //   *ret = (l < r) ? -1 : ((r < l) ? 1 : 0)
    // }
    let cmp_id = mb.build_function("cmp", |f| {
        let ret = f.new_param(8, 8);
        let left = f.new_param(8, 8);
        let right = f.new_param(8, 8);
        let l = f.new_local(8, 8);
        let r = f.new_local(8, 8);
        let flag = f.new_local(1, 1);
        let verdict = f.new_local(4, 4);

        f.emit_op(Bytecode::Deref8);
        f.emit_local(l.as_address());
        f.emit_local(left);
        f.emit_op(Bytecode::Deref8);
        f.emit_local(r.as_address());
        f.emit_local(right);

        let not_less = f.create_label();
        let done = f.create_label();
        f.emit_assign_imm4(verdict, 0);
        f.emit_binary(Bytecode::LessThanI64, flag, l, r);
        f.emit_jump_if_false(flag, not_less);
        f.emit_assign_imm4(verdict, -1);
        f.emit_jump(done);
        f.bind_label(not_less);
        f.emit_binary(Bytecode::LessThanI64, flag, r, l);
        f.emit_jump_if_false(flag, done);
        f.emit_assign_imm4(verdict, 1);
        f.bind_label(done);

        f.emit_op(Bytecode::Assign4);
        f.emit_local(ret);
        f.emit_local(verdict);
        f.emit_return();
    });

    // fn run(sorter: *Sorter) { sorterInit(sorter, cmp, 8) }
    mb.build_function("run", |f| {
        let sorter = f.new_param(8, 8);
        f.emit_op(Bytecode::SorterInit);
        f.emit_local(sorter);
        f.emit_function_id(cmp_id);
        f.emit_uimm4(8);
        f.emit_return();
    });

    let module = Arc::new(mb.finish().unwrap());

    // Init the sorter from bytecode, then fill and sort natively.
    let mut slot = std::mem::MaybeUninit::<Sorter>::uninit();
    VM::invoke_by_name(&module, "run", &pack_ptrs(&[slot.as_mut_ptr() as usize])).unwrap();
    let mut sorter = unsafe { slot.assume_init() };

    for value in [5i64, 1, 9, 3, 7] {
        let ptr = sorter.alloc_input_tuple();
        unsafe { (ptr as *mut i64).write_unaligned(value) };
    }
    sorter.sort();
    let sorted: Vec<i64> = sorter
        .iter()
        .map(|ptr| unsafe { (ptr as *const i64).read_unaligned() })
        .collect();
    assert_eq!(sorted, vec![1, 3, 5, 7, 9]);
}
