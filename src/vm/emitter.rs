//! Programmatic construction of modules: frame layout assignment, operand
//! encoding, and forward-jump patching. Hosts and tests build functions with
//! this; a language front-end would sit on top of the same interface.

use crate::vm::bytecode::{Bytecode, LocalVar, OperandType};
use crate::vm::module::{FunctionInfo, LocalInfo, Module, ModuleError};

/// A forward-patchable jump target.
#[derive(Clone, Copy, Debug)]
pub struct Label(usize);

struct PendingFunction {
    name: String,
    frame_size: usize,
    params_start_pos: usize,
    params_size: usize,
    params: Vec<LocalInfo>,
    code: Vec<u8>,
}

/// Builds one function: allocates frame slots and emits encoded
/// instructions. Parameters must be declared before other locals.
pub struct FunctionBuilder {
    name: String,
    frame_size: usize,
    params: Vec<LocalInfo>,
    params_done: bool,
    code: Vec<u8>,
    /// Bound position of each label, or `usize::MAX` while unbound.
    labels: Vec<usize>,
    /// (operand position, label) pairs awaiting a bind.
    patches: Vec<(usize, usize)>,
}

impl FunctionBuilder {
    fn new(name: &str) -> Self {
        FunctionBuilder {
            name: name.to_string(),
            frame_size: 0,
            params: Vec::new(),
            params_done: false,
            code: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    fn alloc_slot(&mut self, size: usize, align: usize) -> u32 {
        debug_assert!(align.is_power_of_two());
        let offset = (self.frame_size + align - 1) & !(align - 1);
        self.frame_size = offset + size;
        offset as u32
    }

    /// Declares the next parameter slot.
    pub fn new_param(&mut self, size: usize, align: usize) -> LocalVar {
        assert!(!self.params_done, "parameters must precede locals");
        let offset = self.alloc_slot(size, align);
        self.params.push(LocalInfo {
            offset,
            size: size as u32,
        });
        LocalVar::value(offset)
    }

    /// Declares a non-parameter local slot.
    pub fn new_local(&mut self, size: usize, align: usize) -> LocalVar {
        self.params_done = true;
        LocalVar::value(self.alloc_slot(size, align))
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(usize::MAX);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current code position and patches any forward
    /// references.
    pub fn bind_label(&mut self, label: Label) {
        debug_assert_eq!(self.labels[label.0], usize::MAX, "label bound twice");
        let target = self.code.len();
        self.labels[label.0] = target;
        let mut idx = 0;
        while idx < self.patches.len() {
            let (operand_pos, pending) = self.patches[idx];
            if pending == label.0 {
                let offset = (target as i64 - operand_pos as i64) as i32;
                self.code[operand_pos..operand_pos + 4].copy_from_slice(&offset.to_le_bytes());
                self.patches.swap_remove(idx);
            } else {
                idx += 1;
            }
        }
    }

    // ---- raw emission ----

    pub fn emit_op(&mut self, op: Bytecode) {
        self.code.extend_from_slice(&(op as u16).to_le_bytes());
    }

    pub fn emit_local(&mut self, var: LocalVar) {
        self.code.extend_from_slice(&var.encode().to_le_bytes());
    }

    pub fn emit_imm1(&mut self, value: i8) {
        self.code.push(value as u8);
    }

    pub fn emit_imm2(&mut self, value: i16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_imm4(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_imm8(&mut self, value: i64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_uimm2(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_uimm4(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_function_id(&mut self, id: u16) {
        self.code.extend_from_slice(&id.to_le_bytes());
    }

    /// Emits a jump-offset operand referring to `label`. Offsets are
    /// measured from the start of the operand itself.
    pub fn emit_jump_offset(&mut self, label: Label) {
        let operand_pos = self.code.len();
        if self.labels[label.0] == usize::MAX {
            self.patches.push((operand_pos, label.0));
            self.code.extend_from_slice(&0i32.to_le_bytes());
        } else {
            let offset = (self.labels[label.0] as i64 - operand_pos as i64) as i32;
            self.code.extend_from_slice(&offset.to_le_bytes());
        }
    }

    // ---- typed helpers ----

    /// dest = lhs `op` rhs. The destination operand is emitted in address
    /// mode so the handler writes through the slot.
    pub fn emit_binary(&mut self, op: Bytecode, dest: LocalVar, lhs: LocalVar, rhs: LocalVar) {
        debug_assert_eq!(op.operands(), &[OperandType::Local; 3]);
        self.emit_op(op);
        self.emit_local(dest.as_address());
        self.emit_local(lhs);
        self.emit_local(rhs);
    }

    /// dest = `op` input.
    pub fn emit_unary(&mut self, op: Bytecode, dest: LocalVar, input: LocalVar) {
        debug_assert_eq!(op.operands(), &[OperandType::Local; 2]);
        self.emit_op(op);
        self.emit_local(dest.as_address());
        self.emit_local(input);
    }

    pub fn emit_assign_imm1(&mut self, dest: LocalVar, value: i8) {
        self.emit_op(Bytecode::AssignImm1);
        self.emit_local(dest.as_address());
        self.emit_imm1(value);
    }

    pub fn emit_assign_imm2(&mut self, dest: LocalVar, value: i16) {
        self.emit_op(Bytecode::AssignImm2);
        self.emit_local(dest.as_address());
        self.emit_imm2(value);
    }

    pub fn emit_assign_imm4(&mut self, dest: LocalVar, value: i32) {
        self.emit_op(Bytecode::AssignImm4);
        self.emit_local(dest.as_address());
        self.emit_imm4(value);
    }

    pub fn emit_assign_imm8(&mut self, dest: LocalVar, value: i64) {
        self.emit_op(Bytecode::AssignImm8);
        self.emit_local(dest.as_address());
        self.emit_imm8(value);
    }

    pub fn emit_jump(&mut self, label: Label) {
        self.emit_op(Bytecode::Jump);
        self.emit_jump_offset(label);
    }

    pub fn emit_jump_if_true(&mut self, cond: LocalVar, label: Label) {
        self.emit_op(Bytecode::JumpIfTrue);
        self.emit_local(cond);
        self.emit_jump_offset(label);
    }

    pub fn emit_jump_if_false(&mut self, cond: LocalVar, label: Label) {
        self.emit_op(Bytecode::JumpIfFalse);
        self.emit_local(cond);
        self.emit_jump_offset(label);
    }

    /// Calls `callee` with the given argument locals. Address-mode
    /// arguments pass the slot's address; value-mode arguments copy the
    /// slot's bytes into the callee's parameter slot.
    pub fn emit_call(&mut self, callee: u16, args: &[LocalVar]) {
        self.emit_op(Bytecode::Call);
        self.emit_function_id(callee);
        self.emit_uimm2(args.len() as u16);
        for &arg in args {
            self.emit_local(arg);
        }
    }

    pub fn emit_return(&mut self) {
        self.emit_op(Bytecode::Return);
    }
}

/// Collects finished functions into a validated [`Module`].
pub struct ModuleBuilder {
    functions: Vec<PendingFunction>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            functions: Vec::new(),
        }
    }

    /// Reserves the next function id. Functions may call any id declared
    /// with the builder, including forward references.
    pub fn declare_function(&mut self, name: &str) -> u16 {
        self.functions.push(PendingFunction {
            name: name.to_string(),
            frame_size: 0,
            params_start_pos: 0,
            params_size: 0,
            params: Vec::new(),
            code: Vec::new(),
        });
        (self.functions.len() - 1) as u16
    }

    /// Finalizes the body of a declared function.
    pub fn define_function(&mut self, id: u16, builder: FunctionBuilder) {
        assert!(
            builder.patches.is_empty(),
            "unbound label in function {}",
            builder.name
        );
        let pending = &mut self.functions[id as usize];
        assert_eq!(pending.name, builder.name, "function id/name mismatch");
        pending.params_start_pos = builder.params.first().map_or(0, |p| p.offset as usize);
        pending.params_size = builder
            .params
            .iter()
            .map(|p| p.offset as usize + p.size as usize)
            .max()
            .unwrap_or(0);
        pending.params = builder.params;
        pending.frame_size = builder.frame_size.max(1);
        pending.code = builder.code;
    }

    /// Convenience: declare + build + define in one step.
    pub fn build_function(
        &mut self,
        name: &str,
        build: impl FnOnce(&mut FunctionBuilder),
    ) -> u16 {
        let id = self.declare_function(name);
        let mut builder = FunctionBuilder::new(name);
        build(&mut builder);
        self.define_function(id, builder);
        id
    }

    /// Begins a function body for a previously declared id.
    pub fn function_builder(&self, id: u16) -> FunctionBuilder {
        FunctionBuilder::new(&self.functions[id as usize].name)
    }

    pub fn finish(self) -> Result<Module, ModuleError> {
        let mut bytecode = Vec::new();
        let mut functions = Vec::with_capacity(self.functions.len());
        for pending in self.functions {
            let start = bytecode.len();
            bytecode.extend_from_slice(&pending.code);
            functions.push(FunctionInfo {
                name: pending.name,
                frame_size: pending.frame_size,
                params_start_pos: pending.params_start_pos,
                params_size: pending.params_size,
                params: pending.params,
                bytecode_range: start..bytecode.len(),
            });
        }
        Module::new(functions, bytecode)
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jumps_are_patched() {
        let mut mb = ModuleBuilder::new();
        mb.build_function("skip", |f| {
            let flag = f.new_local(1, 1);
            let end = f.create_label();
            f.emit_assign_imm1(flag, 1);
            f.emit_jump(end);
            // Unreachable filler the jump must skip.
            f.emit_assign_imm1(flag, 0);
            f.bind_label(end);
            f.emit_return();
        });
        let module = mb.finish().expect("valid module");
        let listing = module.disassemble(0).unwrap();
        assert!(listing.contains("Jump"), "{listing}");
    }

    #[test]
    fn param_layout_is_recorded() {
        let mut mb = ModuleBuilder::new();
        mb.build_function("two_params", |f| {
            f.new_param(8, 8);
            f.new_param(4, 4);
            f.new_local(8, 8);
            f.emit_return();
        });
        let module = mb.finish().unwrap();
        let func = module.function(0).unwrap();
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.params_start_pos, 0);
        assert_eq!(func.params_size, 12);
        assert!(func.frame_size >= 20);
    }
}
