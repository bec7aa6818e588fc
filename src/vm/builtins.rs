//! The closed catalog of builtin functions exposed to compiled programs.
//!
//! Each builtin has three views: its enum tag, the surface name a front-end
//! resolves, and a check function that validates argument counts and types
//! and yields the call's return type. Semantic errors are values, not
//! control flow: checks return a [`Diagnostic`] the caller collects so one
//! compile can report many errors.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::vm::bytecode::Bytecode;

/// The type language the checks run over. Opaque types name engine
/// structures that programs only ever handle through pointers.
#[derive(Clone, Debug, PartialEq)]
pub enum TplType {
    Nil,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Ptr(Box<TplType>),
    Opaque(&'static str),
    Function {
        params: Vec<TplType>,
        ret: Box<TplType>,
    },
}

impl TplType {
    pub fn ptr_to(inner: TplType) -> TplType {
        TplType::Ptr(Box::new(inner))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, TplType::Ptr(_))
    }
}

pub const AGG_HASH_TABLE: &str = "AggregationHashTable";
pub const JOIN_HASH_TABLE: &str = "JoinHashTable";
pub const SORTER: &str = "Sorter";
pub const THREAD_STATE_CONTAINER: &str = "ThreadStateContainer";
pub const EXECUTION_CONTEXT: &str = "ExecutionContext";
pub const VPI: &str = "VectorProjectionIterator";

/// One semantic error produced while checking a builtin call.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub message: String,
    /// Which argument triggered the error, if one did.
    pub arg_index: Option<usize>,
}

impl Diagnostic {
    fn new(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            arg_index: None,
        }
    }

    fn at_arg(message: impl Into<String>, arg_index: usize) -> Self {
        Diagnostic {
            message: message.into(),
            arg_index: Some(arg_index),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.arg_index {
            Some(idx) => write!(f, "argument {}: {}", idx, self.message),
            None => f.write_str(&self.message),
        }
    }
}

macro_rules! builtins {
    ($(($variant:ident, $name:literal, $bytecode:ident)),+ $(,)?) => {
        /// Unique internal tags for every builtin.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Builtin {
            $($variant),+
        }

        impl Builtin {
            pub const ALL: &'static [Builtin] = &[$(Builtin::$variant),+];

            /// The surface name used in source programs.
            pub fn name(self) -> &'static str {
                match self {
                    $(Builtin::$variant => $name),+
                }
            }

            /// The dedicated opcode implementing this builtin.
            pub fn bytecode(self) -> Bytecode {
                match self {
                    $(Builtin::$variant => Bytecode::$bytecode),+
                }
            }
        }
    };
}

builtins! {
    (VpiHasNext, "vpiHasNext", VPIHasNext),
    (VpiAdvance, "vpiAdvance", VPIAdvance),
    (VpiReset, "vpiReset", VPIReset),
    (VpiSetPosition, "vpiSetPosition", VPISetPosition),
    (VpiGetTinyInt, "vpiGetTinyInt", VPIGetTinyInt),
    (VpiGetSmallInt, "vpiGetSmallInt", VPIGetSmallInt),
    (VpiGetInteger, "vpiGetInt", VPIGetInteger),
    (VpiGetBigInt, "vpiGetBigInt", VPIGetBigInt),
    (VpiGetFloat, "vpiGetReal", VPIGetFloat),
    (VpiGetDouble, "vpiGetDouble", VPIGetDouble),
    (VpiIsNull, "vpiIsNull", VPIIsNull),
    (HashInt, "hashInt", HashInt),
    (HashDouble, "hashDouble", HashDouble),
    (HashCombine, "hashCombine", HashCombine),
    (AggHashTableInit, "aggHTInit", AggHashTableInit),
    (AggHashTableInsert, "aggHTInsert", AggHashTableInsert),
    (AggHashTableInsertPartitioned, "aggHTInsertPartitioned", AggHashTableInsertPartitioned),
    (AggHashTableProcessBatch, "aggHTProcessBatch", AggHashTableProcessBatch),
    (AggHashTableMovePartitions, "aggHTMovePartitions", AggHashTableTransferPartitions),
    (AggHashTableParallelScan, "aggHTParallelPartScan", AggHashTableParallelScan),
    (AggHashTableFree, "aggHTFree", AggHashTableFree),
    (JoinHashTableInit, "joinHTInit", JoinHashTableInit),
    (JoinHashTableAllocTuple, "joinHTAlloc", JoinHashTableAllocTuple),
    (JoinHashTableBuild, "joinHTBuild", JoinHashTableBuild),
    (JoinHashTableBuildParallel, "joinHTBuildParallel", JoinHashTableBuildParallel),
    (JoinHashTableFree, "joinHTFree", JoinHashTableFree),
    (SorterInit, "sorterInit", SorterInit),
    (SorterInsert, "sorterInsert", SorterAllocTuple),
    (SorterInsertTopK, "sorterInsertTopK", SorterAllocTupleTopK),
    (SorterInsertTopKFinish, "sorterInsertTopKFinish", SorterAllocTupleTopKFinish),
    (SorterSort, "sorterSort", SorterSort),
    (SorterSortParallel, "sorterSortParallel", SorterSortParallel),
    (SorterSortTopKParallel, "sorterSortTopKParallel", SorterSortTopKParallel),
    (SorterFree, "sorterFree", SorterFree),
    (TlsReset, "tlsReset", ThreadStateContainerReset),
    (TlsIterate, "tlsIterate", ThreadStateContainerIterate),
    (TlsClear, "tlsClear", ThreadStateContainerClear),
    (ExecCtxGetTls, "execCtxGetTLS", ExecutionContextGetTLS),
}

static BY_NAME: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    Builtin::ALL.iter().map(|&b| (b.name(), b)).collect()
});

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        BY_NAME.get(name).copied()
    }

    /// Validates a call's arguments and returns the call's type.
    pub fn check_call(self, args: &[TplType]) -> Result<TplType, Diagnostic> {
        use Builtin::*;
        match self {
            VpiHasNext => {
                check_args(self, args, &[ptr_to_opaque(VPI)])?;
                Ok(TplType::Bool)
            }
            VpiAdvance | VpiReset => {
                check_args(self, args, &[ptr_to_opaque(VPI)])?;
                Ok(TplType::Nil)
            }
            VpiSetPosition => {
                check_args(self, args, &[ptr_to_opaque(VPI), TplType::UInt64])?;
                Ok(TplType::Nil)
            }
            VpiGetTinyInt => self.check_vpi_get(args, TplType::Int8),
            VpiGetSmallInt => self.check_vpi_get(args, TplType::Int16),
            VpiGetInteger => self.check_vpi_get(args, TplType::Int32),
            VpiGetBigInt => self.check_vpi_get(args, TplType::Int64),
            VpiGetFloat => self.check_vpi_get(args, TplType::Float32),
            VpiGetDouble => self.check_vpi_get(args, TplType::Float64),
            VpiIsNull => self.check_vpi_get(args, TplType::Bool),
            HashInt => {
                check_args(self, args, &[TplType::Int64])?;
                Ok(TplType::UInt64)
            }
            HashDouble => {
                check_args(self, args, &[TplType::Float64])?;
                Ok(TplType::UInt64)
            }
            HashCombine => {
                check_args(self, args, &[TplType::UInt64, TplType::UInt64])?;
                Ok(TplType::UInt64)
            }
            AggHashTableInit => {
                check_args(self, args, &[ptr_to_opaque(AGG_HASH_TABLE), TplType::UInt32])?;
                Ok(TplType::Nil)
            }
            AggHashTableInsert | AggHashTableInsertPartitioned => {
                check_args(self, args, &[ptr_to_opaque(AGG_HASH_TABLE), TplType::UInt64])?;
                Ok(TplType::ptr_to(TplType::UInt8))
            }
            AggHashTableProcessBatch => {
                check_arg_count(self, args, 7)?;
                check_ptr_to(args, 0, AGG_HASH_TABLE)?;
                check_ptr_to(args, 1, VPI)?;
                check_callback(args, 2, 2)?;
                check_callback(args, 3, 3)?;
                check_callback(args, 4, 2)?;
                check_callback(args, 5, 2)?;
                check_exact(args, 6, &TplType::Bool)?;
                Ok(TplType::Nil)
            }
            AggHashTableMovePartitions => {
                check_args(
                    self,
                    args,
                    &[
                        ptr_to_opaque(AGG_HASH_TABLE),
                        ptr_to_opaque(THREAD_STATE_CONTAINER),
                        TplType::UInt32,
                    ],
                )?;
                Ok(TplType::Nil)
            }
            AggHashTableParallelScan => {
                check_arg_count(self, args, 5)?;
                check_ptr_to(args, 0, AGG_HASH_TABLE)?;
                check_ptr_to(args, 1, EXECUTION_CONTEXT)?;
                check_callback(args, 2, 3)?;
                check_callback(args, 3, 2)?;
                check_callback(args, 4, 1)?;
                Ok(TplType::Nil)
            }
            AggHashTableFree => {
                check_args(self, args, &[ptr_to_opaque(AGG_HASH_TABLE)])?;
                Ok(TplType::Nil)
            }
            JoinHashTableInit => {
                check_args(
                    self,
                    args,
                    &[ptr_to_opaque(JOIN_HASH_TABLE), TplType::UInt32, TplType::Bool],
                )?;
                Ok(TplType::Nil)
            }
            JoinHashTableAllocTuple => {
                check_args(self, args, &[ptr_to_opaque(JOIN_HASH_TABLE), TplType::UInt64])?;
                Ok(TplType::ptr_to(TplType::UInt8))
            }
            JoinHashTableBuild | JoinHashTableFree => {
                check_args(self, args, &[ptr_to_opaque(JOIN_HASH_TABLE)])?;
                Ok(TplType::Nil)
            }
            JoinHashTableBuildParallel => {
                check_args(
                    self,
                    args,
                    &[
                        ptr_to_opaque(JOIN_HASH_TABLE),
                        ptr_to_opaque(THREAD_STATE_CONTAINER),
                        TplType::UInt32,
                        ptr_to_opaque(EXECUTION_CONTEXT),
                    ],
                )?;
                Ok(TplType::Nil)
            }
            SorterInit => {
                check_arg_count(self, args, 3)?;
                check_ptr_to(args, 0, SORTER)?;
                check_callback(args, 1, 3)?;
                check_exact(args, 2, &TplType::UInt32)?;
                Ok(TplType::Nil)
            }
            SorterInsert => {
                check_args(self, args, &[ptr_to_opaque(SORTER)])?;
                Ok(TplType::ptr_to(TplType::UInt8))
            }
            SorterInsertTopK => {
                check_args(self, args, &[ptr_to_opaque(SORTER), TplType::UInt32])?;
                Ok(TplType::ptr_to(TplType::UInt8))
            }
            SorterInsertTopKFinish => {
                check_args(self, args, &[ptr_to_opaque(SORTER), TplType::UInt32])?;
                Ok(TplType::Nil)
            }
            SorterSort | SorterFree => {
                check_args(self, args, &[ptr_to_opaque(SORTER)])?;
                Ok(TplType::Nil)
            }
            SorterSortParallel => {
                check_args(
                    self,
                    args,
                    &[
                        ptr_to_opaque(SORTER),
                        ptr_to_opaque(THREAD_STATE_CONTAINER),
                        TplType::UInt32,
                        ptr_to_opaque(EXECUTION_CONTEXT),
                    ],
                )?;
                Ok(TplType::Nil)
            }
            SorterSortTopKParallel => {
                check_args(
                    self,
                    args,
                    &[
                        ptr_to_opaque(SORTER),
                        ptr_to_opaque(THREAD_STATE_CONTAINER),
                        TplType::UInt32,
                        TplType::UInt32,
                        ptr_to_opaque(EXECUTION_CONTEXT),
                    ],
                )?;
                Ok(TplType::Nil)
            }
            TlsReset => {
                check_arg_count(self, args, 5)?;
                check_ptr_to(args, 0, THREAD_STATE_CONTAINER)?;
                check_exact(args, 1, &TplType::UInt32)?;
                check_callback(args, 2, 2)?;
                check_callback(args, 3, 2)?;
                if !args[4].is_pointer() {
                    return Err(Diagnostic::at_arg("context must be a pointer", 4));
                }
                Ok(TplType::Nil)
            }
            TlsIterate => {
                check_arg_count(self, args, 3)?;
                check_ptr_to(args, 0, THREAD_STATE_CONTAINER)?;
                if !args[1].is_pointer() {
                    return Err(Diagnostic::at_arg("context must be a pointer", 1));
                }
                check_callback(args, 2, 2)?;
                Ok(TplType::Nil)
            }
            TlsClear => {
                check_args(self, args, &[ptr_to_opaque(THREAD_STATE_CONTAINER)])?;
                Ok(TplType::Nil)
            }
            ExecCtxGetTls => {
                check_args(self, args, &[ptr_to_opaque(EXECUTION_CONTEXT)])?;
                Ok(TplType::ptr_to(TplType::Opaque(THREAD_STATE_CONTAINER)))
            }
        }
    }

    fn check_vpi_get(self, args: &[TplType], ret: TplType) -> Result<TplType, Diagnostic> {
        check_args(self, args, &[ptr_to_opaque(VPI), TplType::UInt32])?;
        Ok(ret)
    }
}

fn ptr_to_opaque(name: &'static str) -> TplType {
    TplType::ptr_to(TplType::Opaque(name))
}

fn check_arg_count(builtin: Builtin, args: &[TplType], expected: usize) -> Result<(), Diagnostic> {
    if args.len() != expected {
        return Err(Diagnostic::new(format!(
            "{} expects {} arguments, got {}",
            builtin.name(),
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn check_exact(args: &[TplType], idx: usize, expected: &TplType) -> Result<(), Diagnostic> {
    if &args[idx] != expected {
        return Err(Diagnostic::at_arg(
            format!("expected {expected:?}, got {:?}", args[idx]),
            idx,
        ));
    }
    Ok(())
}

fn check_ptr_to(args: &[TplType], idx: usize, opaque: &'static str) -> Result<(), Diagnostic> {
    match &args[idx] {
        TplType::Ptr(inner) if **inner == TplType::Opaque(opaque) => Ok(()),
        other => Err(Diagnostic::at_arg(
            format!("expected *{opaque}, got {other:?}"),
            idx,
        )),
    }
}

/// Callbacks take only pointer parameters (out-pointer return convention)
/// and return nil.
fn check_callback(args: &[TplType], idx: usize, arity: usize) -> Result<(), Diagnostic> {
    match &args[idx] {
        TplType::Function { params, ret } => {
            if params.len() != arity {
                return Err(Diagnostic::at_arg(
                    format!("callback expects {arity} parameters, got {}", params.len()),
                    idx,
                ));
            }
            if let Some(bad) = params.iter().position(|p| !p.is_pointer()) {
                return Err(Diagnostic::at_arg(
                    format!("callback parameter {bad} must be a pointer"),
                    idx,
                ));
            }
            if **ret != TplType::Nil {
                return Err(Diagnostic::at_arg("callback must return nil", idx));
            }
            Ok(())
        }
        other => Err(Diagnostic::at_arg(
            format!("expected a function, got {other:?}"),
            idx,
        )),
    }
}

fn check_args(builtin: Builtin, args: &[TplType], expected: &[TplType]) -> Result<(), Diagnostic> {
    check_arg_count(builtin, args, expected.len())?;
    for (idx, want) in expected.iter().enumerate() {
        check_exact(args, idx, want)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_and_bytecodes_are_unique() {
        let mut names = std::collections::HashSet::new();
        let mut bytecodes = std::collections::HashSet::new();
        for &builtin in Builtin::ALL {
            assert!(names.insert(builtin.name()), "duplicate name {}", builtin.name());
            assert!(
                bytecodes.insert(builtin.bytecode() as u16),
                "duplicate bytecode for {}",
                builtin.name()
            );
            assert_eq!(Builtin::from_name(builtin.name()), Some(builtin));
        }
    }

    #[test]
    fn join_init_signature_checks() {
        let good = [
            TplType::ptr_to(TplType::Opaque(JOIN_HASH_TABLE)),
            TplType::UInt32,
            TplType::Bool,
        ];
        assert_eq!(
            Builtin::JoinHashTableInit.check_call(&good),
            Ok(TplType::Nil)
        );

        let wrong_count = &good[..2];
        assert!(Builtin::JoinHashTableInit.check_call(wrong_count).is_err());

        let mut wrong_type = good.clone();
        wrong_type[0] = TplType::ptr_to(TplType::Opaque(SORTER));
        let err = Builtin::JoinHashTableInit.check_call(&wrong_type).unwrap_err();
        assert_eq!(err.arg_index, Some(0));
    }

    #[test]
    fn callback_arity_and_pointerness_are_enforced() {
        let cmp = TplType::Function {
            params: vec![
                TplType::ptr_to(TplType::Int32),
                TplType::ptr_to(TplType::UInt8),
                TplType::ptr_to(TplType::UInt8),
            ],
            ret: Box::new(TplType::Nil),
        };
        let good = [
            TplType::ptr_to(TplType::Opaque(SORTER)),
            cmp.clone(),
            TplType::UInt32,
        ];
        assert_eq!(Builtin::SorterInit.check_call(&good), Ok(TplType::Nil));

        let mut bad_arity = good.clone();
        bad_arity[1] = TplType::Function {
            params: vec![TplType::ptr_to(TplType::UInt8)],
            ret: Box::new(TplType::Nil),
        };
        assert!(Builtin::SorterInit.check_call(&bad_arity).is_err());

        let mut bad_param = good;
        bad_param[1] = TplType::Function {
            params: vec![TplType::Int32, TplType::Int32, TplType::Int32],
            ret: Box::new(TplType::Nil),
        };
        let err = Builtin::SorterInit.check_call(&bad_param).unwrap_err();
        assert_eq!(err.arg_index, Some(1));
    }
}
