//! Module file format: serialization round-trips, disassembly, and the
//! load-time rejection of malformed modules.

use std::sync::Arc;

use kestrel::vm::{Bytecode, Module, ModuleBuilder, ModuleError, VM};

fn sample_module() -> Module {
    let mut mb = ModuleBuilder::new();

    let helper_id = mb.declare_function("helper");
    let mut f = mb.function_builder(helper_id);
    let out = f.new_param(8, 8);
    let v = f.new_local(8, 8);
    f.emit_assign_imm8(v, 11);
    f.emit_op(Bytecode::Assign8);
    f.emit_local(out);
    f.emit_local(v);
    f.emit_return();
    mb.define_function(helper_id, f);

    let main_id = mb.declare_function("main");
    let mut f = mb.function_builder(main_id);
    let ret = f.new_param(8, 8);
    let slot = f.new_local(8, 8);
    let skip = f.create_label();
    f.emit_call(helper_id, &[slot.as_address()]);
    f.emit_jump(skip);
    f.emit_assign_imm8(slot, 0);
    f.bind_label(skip);
    f.emit_op(Bytecode::Assign8);
    f.emit_local(ret);
    f.emit_local(slot);
    f.emit_return();
    mb.define_function(main_id, f);

    mb.finish().expect("sample module is valid")
}

#[test]
fn serialize_deserialize_round_trips() {
    let module = sample_module();
    let bytes = module.serialize();
    let restored = Module::deserialize(&bytes).expect("round trip");

    assert_eq!(restored.num_functions(), module.num_functions());
    for id in 0..module.num_functions() as u16 {
        let original = module.function(id).unwrap();
        let loaded = restored.function(id).unwrap();
        assert_eq!(original.name, loaded.name);
        assert_eq!(original.frame_size, loaded.frame_size);
        assert_eq!(original.params_start_pos, loaded.params_start_pos);
        assert_eq!(original.params_size, loaded.params_size);
        assert_eq!(original.params, loaded.params);
        assert_eq!(original.bytecode_range, loaded.bytecode_range);
    }
    assert_eq!(module.bytecode(), restored.bytecode());

    // A deserialized module executes identically.
    let restored = Arc::new(restored);
    let mut result: i64 = 0;
    let args = (&mut result as *mut i64 as usize).to_le_bytes().to_vec();
    VM::invoke_by_name(&restored, "main", &args).unwrap();
    assert_eq!(result, 11);
}

#[test]
fn serialized_module_survives_disk() {
    let module = sample_module();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.kbc");
    std::fs::write(&path, module.serialize()).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let restored = Module::deserialize(&bytes).unwrap();
    assert!(restored.function_by_name("helper").is_some());
}

#[test]
fn rejects_bad_magic_and_version() {
    let module = sample_module();
    let mut bytes = module.serialize();
    bytes[0] ^= 0xFF;
    assert!(matches!(
        Module::deserialize(&bytes),
        Err(ModuleError::BadMagic(_))
    ));

    let mut bytes = module.serialize();
    bytes[4] = 0xEE;
    assert!(matches!(
        Module::deserialize(&bytes),
        Err(ModuleError::UnsupportedVersion(_))
    ));
}

#[test]
fn rejects_truncated_modules() {
    let bytes = sample_module().serialize();
    for cut in [3usize, 9, bytes.len() / 2] {
        assert!(
            Module::deserialize(&bytes[..cut]).is_err(),
            "truncation at {cut} must be rejected"
        );
    }
}

#[test]
fn rejects_unknown_opcodes() {
    let module = sample_module();
    let main = module.function_by_name("main").unwrap().1;
    let opcode_pos = main.bytecode_range.start;

    let mut bytes = module.serialize();
    // Header is 16 bytes; the function table precedes the bytecode, so find
    // the bytecode by re-serializing with a corrupted instruction instead.
    let bytecode_offset = bytes.len() - module.bytecode().len() - name_pool_len(&module);
    bytes[bytecode_offset + opcode_pos] = 0xFF;
    bytes[bytecode_offset + opcode_pos + 1] = 0xFF;
    assert!(matches!(
        Module::deserialize(&bytes),
        Err(ModuleError::UnknownOpcode { .. })
    ));
}

#[test]
fn rejects_jumps_that_leave_the_function() {
    // Hand-assemble: Jump with an offset far beyond the function.
    let mut mb = ModuleBuilder::new();
    mb.build_function("bad", |f| {
        let target = f.create_label();
        f.bind_label(target);
        f.emit_op(Bytecode::Jump);
        f.emit_imm4(1_000_000);
        f.emit_return();
    });
    assert!(matches!(
        mb.finish(),
        Err(ModuleError::JumpOutOfBounds { .. })
    ));
}

#[test]
fn rejects_jumps_into_operands() {
    let mut mb = ModuleBuilder::new();
    mb.build_function("bad", |f| {
        // Jump lands one byte inside the following instruction.
        f.emit_op(Bytecode::Jump);
        f.emit_imm4(5);
        f.emit_return();
    });
    assert!(matches!(
        mb.finish(),
        Err(ModuleError::JumpIntoOperands { .. })
    ));
}

#[test]
fn disassembly_names_functions_and_targets() {
    let module = sample_module();
    let (main_id, _) = module.function_by_name("main").unwrap();
    let listing = module.disassemble(main_id).unwrap();
    assert!(listing.contains("Call helper"), "{listing}");
    assert!(listing.contains("Jump"), "{listing}");
    assert!(listing.contains("Return"), "{listing}");
}

fn name_pool_len(module: &Module) -> usize {
    (0..module.num_functions() as u16)
        .map(|id| 4 + module.function(id).unwrap().name.len())
        .sum()
}
