//! The compiled artifact: function metadata plus one contiguous bytecode
//! array, with a pinned binary file format and a load-time integrity check
//! that rejects malformed modules before anything executes.

use crate::vm::bytecode::{Bytecode, LocalVar, OperandType};

pub const MODULE_MAGIC: u32 = 0x6B62_6331; // "kbc1"
pub const MODULE_VERSION: u32 = 1;

/// Offset and size of one parameter slot in a function's frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalInfo {
    pub offset: u32,
    pub size: u32,
}

/// Compile-time layout of one function.
#[derive(Clone, Debug)]
pub struct FunctionInfo {
    pub name: String,
    /// Total frame bytes: parameters, locals and temporaries.
    pub frame_size: usize,
    /// Where the parameter block starts inside the frame.
    pub params_start_pos: usize,
    /// Total bytes of all parameter slots.
    pub params_size: usize,
    /// Parameter slots, in declaration order.
    pub params: Vec<LocalInfo>,
    /// This function's slice of the module bytecode.
    pub bytecode_range: std::ops::Range<usize>,
}

#[derive(Debug)]
pub enum ModuleError {
    BadMagic(u32),
    UnsupportedVersion(u32),
    Truncated,
    BadName,
    UnknownOpcode { function: String, offset: usize, raw: u16 },
    JumpOutOfBounds { function: String, offset: usize },
    JumpIntoOperands { function: String, offset: usize },
    BadFunctionId { function: String, offset: usize, id: u16 },
    BadLocalOffset { function: String, offset: usize },
    BadFunctionLayout { function: String },
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::BadMagic(magic) => write!(f, "bad module magic {magic:#x}"),
            ModuleError::UnsupportedVersion(v) => write!(f, "unsupported module version {v}"),
            ModuleError::Truncated => write!(f, "module file is truncated"),
            ModuleError::BadName => write!(f, "function name is not valid UTF-8"),
            ModuleError::UnknownOpcode { function, offset, raw } => {
                write!(f, "unknown opcode {raw:#x} at {function}+{offset}")
            }
            ModuleError::JumpOutOfBounds { function, offset } => {
                write!(f, "jump at {function}+{offset} leaves the function")
            }
            ModuleError::JumpIntoOperands { function, offset } => {
                write!(f, "jump at {function}+{offset} lands inside an instruction")
            }
            ModuleError::BadFunctionId { function, offset, id } => {
                write!(f, "call at {function}+{offset} names unknown function {id}")
            }
            ModuleError::BadLocalOffset { function, offset } => {
                write!(f, "local operand at {function}+{offset} is outside the frame")
            }
            ModuleError::BadFunctionLayout { function } => {
                write!(f, "function {function} has an invalid layout")
            }
        }
    }
}

impl std::error::Error for ModuleError {}

/// An immutable compiled module.
pub struct Module {
    functions: Vec<FunctionInfo>,
    bytecode: Vec<u8>,
}

impl Module {
    /// Assembles a module from parts and validates it.
    pub fn new(functions: Vec<FunctionInfo>, bytecode: Vec<u8>) -> Result<Self, ModuleError> {
        let module = Module { functions, bytecode };
        module.validate()?;
        Ok(module)
    }

    #[inline]
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    #[inline]
    pub fn function(&self, id: u16) -> Option<&FunctionInfo> {
        self.functions.get(id as usize)
    }

    pub fn function_by_name(&self, name: &str) -> Option<(u16, &FunctionInfo)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
            .map(|(id, f)| (id as u16, f))
    }

    #[inline]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    // ---- integrity ----

    /// Decodes every instruction of every function, checking opcodes, local
    /// offsets, call targets, and that jumps land on instruction boundaries
    /// inside their function.
    fn validate(&self) -> Result<(), ModuleError> {
        for func in &self.functions {
            if func.bytecode_range.end > self.bytecode.len()
                || func.bytecode_range.start > func.bytecode_range.end
                || func.params_start_pos + func.params_size > func.frame_size
            {
                return Err(ModuleError::BadFunctionLayout {
                    function: func.name.clone(),
                });
            }

            let code = &self.bytecode[func.bytecode_range.clone()];
            let mut starts = Vec::new();
            let mut jumps = Vec::new();

            let mut pos = 0usize;
            while pos < code.len() {
                starts.push(pos);
                let raw = read_u16(code, &mut pos).ok_or(ModuleError::Truncated)?;
                let bytecode = Bytecode::from_u16(raw).ok_or_else(|| ModuleError::UnknownOpcode {
                    function: func.name.clone(),
                    offset: pos - 2,
                    raw,
                })?;

                for &operand in bytecode.operands() {
                    let operand_pos = pos;
                    match operand {
                        OperandType::Local => {
                            let encoded =
                                read_u32(code, &mut pos).ok_or(ModuleError::Truncated)?;
                            let var = LocalVar::decode(encoded);
                            if (var.offset() as usize) >= func.frame_size {
                                return Err(ModuleError::BadLocalOffset {
                                    function: func.name.clone(),
                                    offset: operand_pos,
                                });
                            }
                        }
                        OperandType::JumpOffset => {
                            let offset =
                                read_u32(code, &mut pos).ok_or(ModuleError::Truncated)? as i32;
                            let target = operand_pos as i64 + i64::from(offset);
                            if target < 0 || target > code.len() as i64 {
                                return Err(ModuleError::JumpOutOfBounds {
                                    function: func.name.clone(),
                                    offset: operand_pos,
                                });
                            }
                            jumps.push((operand_pos, target as usize));
                        }
                        OperandType::FunctionId => {
                            let id = read_u16(code, &mut pos).ok_or(ModuleError::Truncated)?;
                            // u16::MAX is the "no callback" sentinel.
                            if id != u16::MAX && (id as usize) >= self.functions.len() {
                                return Err(ModuleError::BadFunctionId {
                                    function: func.name.clone(),
                                    offset: operand_pos,
                                    id,
                                });
                            }
                        }
                        OperandType::LocalCount => {
                            let count = read_u16(code, &mut pos).ok_or(ModuleError::Truncated)?;
                            for _ in 0..count {
                                let encoded =
                                    read_u32(code, &mut pos).ok_or(ModuleError::Truncated)?;
                                let var = LocalVar::decode(encoded);
                                if (var.offset() as usize) >= func.frame_size {
                                    return Err(ModuleError::BadLocalOffset {
                                        function: func.name.clone(),
                                        offset: operand_pos,
                                    });
                                }
                            }
                        }
                        other => {
                            pos += other.size();
                            if pos > code.len() {
                                return Err(ModuleError::Truncated);
                            }
                        }
                    }
                }
            }

            for (operand_pos, target) in jumps {
                if target != code.len() && starts.binary_search(&target).is_err() {
                    return Err(ModuleError::JumpIntoOperands {
                        function: func.name.clone(),
                        offset: operand_pos,
                    });
                }
            }
        }
        Ok(())
    }

    // ---- binary format ----

    /// Serializes to the module file layout: header, function table,
    /// bytecode, string pool.
    pub fn serialize(&self) -> Vec<u8> {
        let mut name_pool = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.functions.len());
        for func in &self.functions {
            name_offsets.push(name_pool.len() as u32);
            name_pool.extend_from_slice(&(func.name.len() as u32).to_le_bytes());
            name_pool.extend_from_slice(func.name.as_bytes());
        }

        let mut out = Vec::new();
        out.extend_from_slice(&MODULE_MAGIC.to_le_bytes());
        out.extend_from_slice(&MODULE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.bytecode.len() as u32).to_le_bytes());

        for (func, &name_offset) in self.functions.iter().zip(&name_offsets) {
            out.extend_from_slice(&name_offset.to_le_bytes());
            out.extend_from_slice(&(func.frame_size as u32).to_le_bytes());
            out.extend_from_slice(&(func.params_start_pos as u32).to_le_bytes());
            out.extend_from_slice(&(func.params_size as u32).to_le_bytes());
            out.extend_from_slice(&(func.bytecode_range.start as u32).to_le_bytes());
            out.extend_from_slice(&(func.params.len() as u32).to_le_bytes());
            for local in &func.params {
                out.extend_from_slice(&local.offset.to_le_bytes());
                out.extend_from_slice(&local.size.to_le_bytes());
            }
        }

        out.extend_from_slice(&self.bytecode);
        out.extend_from_slice(&name_pool);
        out
    }

    /// Parses and validates a serialized module.
    pub fn deserialize(bytes: &[u8]) -> Result<Module, ModuleError> {
        let mut pos = 0usize;
        let magic = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
        if magic != MODULE_MAGIC {
            return Err(ModuleError::BadMagic(magic));
        }
        let version = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
        if version != MODULE_VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }
        let num_functions = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)? as usize;
        let bytecode_len = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)? as usize;

        struct RawFunction {
            name_offset: u32,
            frame_size: u32,
            params_start_pos: u32,
            params_size: u32,
            bytecode_offset: u32,
            params: Vec<LocalInfo>,
        }

        let mut raw_functions = Vec::with_capacity(num_functions);
        for _ in 0..num_functions {
            let name_offset = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
            let frame_size = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
            let params_start_pos = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
            let params_size = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
            let bytecode_offset = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
            let num_locals = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
            let mut params = Vec::with_capacity(num_locals as usize);
            for _ in 0..num_locals {
                let offset = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
                let size = read_u32(bytes, &mut pos).ok_or(ModuleError::Truncated)?;
                params.push(LocalInfo { offset, size });
            }
            raw_functions.push(RawFunction {
                name_offset,
                frame_size,
                params_start_pos,
                params_size,
                bytecode_offset,
                params,
            });
        }

        if pos + bytecode_len > bytes.len() {
            return Err(ModuleError::Truncated);
        }
        let bytecode = bytes[pos..pos + bytecode_len].to_vec();
        let name_pool = &bytes[pos + bytecode_len..];

        // Function bytecode ranges run to the next function's offset;
        // functions are serialized in ascending offset order.
        let mut functions = Vec::with_capacity(num_functions);
        for (idx, raw) in raw_functions.iter().enumerate() {
            let end = raw_functions
                .get(idx + 1)
                .map(|next| next.bytecode_offset as usize)
                .unwrap_or(bytecode_len);
            let start = raw.bytecode_offset as usize;
            if start > end || end > bytecode_len {
                return Err(ModuleError::Truncated);
            }

            let mut name_pos = raw.name_offset as usize;
            let name_len = read_u32(name_pool, &mut name_pos).ok_or(ModuleError::Truncated)? as usize;
            let name_bytes = name_pool
                .get(name_pos..name_pos + name_len)
                .ok_or(ModuleError::Truncated)?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| ModuleError::BadName)?
                .to_string();

            functions.push(FunctionInfo {
                name,
                frame_size: raw.frame_size as usize,
                params_start_pos: raw.params_start_pos as usize,
                params_size: raw.params_size as usize,
                params: raw.params.clone(),
                bytecode_range: start..end,
            });
        }

        Module::new(functions, bytecode)
    }

    // ---- disassembly ----

    /// Human-readable instruction listing of one function.
    pub fn disassemble(&self, id: u16) -> Option<String> {
        let func = self.function(id)?;
        let code = &self.bytecode[func.bytecode_range.clone()];
        let mut out = format!(
            "function {} (frame={}, params={})\n",
            func.name,
            func.frame_size,
            func.params.len()
        );

        let mut pos = 0usize;
        while pos < code.len() {
            let at = pos;
            let raw = read_u16(code, &mut pos)?;
            let bytecode = Bytecode::from_u16(raw)?;
            out.push_str(&format!("  {at:>6}  {}", bytecode.name()));
            for &operand in bytecode.operands() {
                match operand {
                    OperandType::Local => {
                        let var = LocalVar::decode(read_u32(code, &mut pos)?);
                        let sigil = match var.mode() {
                            crate::vm::bytecode::AddressMode::Value => "",
                            crate::vm::bytecode::AddressMode::Address => "&",
                        };
                        out.push_str(&format!(" {sigil}local[{}]", var.offset()));
                    }
                    OperandType::Imm1 => out.push_str(&format!(" {}", read_u8(code, &mut pos)? as i8)),
                    OperandType::Imm2 => {
                        out.push_str(&format!(" {}", read_u16(code, &mut pos)? as i16))
                    }
                    OperandType::Imm4 => {
                        out.push_str(&format!(" {}", read_u32(code, &mut pos)? as i32))
                    }
                    OperandType::Imm8 => {
                        out.push_str(&format!(" {}", read_u64(code, &mut pos)? as i64))
                    }
                    OperandType::UImm2 => out.push_str(&format!(" {}", read_u16(code, &mut pos)?)),
                    OperandType::UImm4 => out.push_str(&format!(" {}", read_u32(code, &mut pos)?)),
                    OperandType::JumpOffset => {
                        let operand_pos = pos;
                        let offset = read_u32(code, &mut pos)? as i32;
                        out.push_str(&format!(" -> {}", operand_pos as i64 + i64::from(offset)));
                    }
                    OperandType::FunctionId => {
                        let id = read_u16(code, &mut pos)?;
                        let callee = self.function(id).map(|f| f.name.as_str()).unwrap_or("?");
                        out.push_str(&format!(" {callee}"));
                    }
                    OperandType::LocalCount => {
                        let count = read_u16(code, &mut pos)?;
                        out.push_str(&format!(" argc={count}"));
                        for _ in 0..count {
                            let var = LocalVar::decode(read_u32(code, &mut pos)?);
                            out.push_str(&format!(" local[{}]", var.offset()));
                        }
                    }
                }
            }
            out.push('\n');
        }
        Some(out)
    }
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Option<u8> {
    let value = *bytes.get(*pos)?;
    *pos += 1;
    Some(value)
}

fn read_u16(bytes: &[u8], pos: &mut usize) -> Option<u16> {
    let value = u16::from_le_bytes(bytes.get(*pos..*pos + 2)?.try_into().ok()?);
    *pos += 2;
    Some(value)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let value = u32::from_le_bytes(bytes.get(*pos..*pos + 4)?.try_into().ok()?);
    *pos += 4;
    Some(value)
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let value = u64::from_le_bytes(bytes.get(*pos..*pos + 8)?.try_into().ok()?);
    *pos += 8;
    Some(value)
}
