//! The typed kernel library. Every kernel resolves its element type once per
//! call and runs a monomorphic inner loop over the live positions.

pub mod arith;
pub mod boolean;
pub mod cast;
pub mod compare;
pub mod fill;
pub mod gather;
pub mod hash;
pub mod select;

pub use arith::{arithmetic, arithmetic_val, negate, val_arithmetic, ArithKind};
pub use boolean::{all_true, and, any_true, is_not_null, is_null, not, or};
pub use cast::cast;
pub use compare::{compare, compare_val, val_compare, CmpKind};
pub use fill::{fill, generate};
pub use gather::{gather_select, gather_select_val};
pub use hash::{hash, hash_combine, hash_scalar, NULL_HASH};
pub use select::{select, select_val};

use crate::types::TypeId;

/// Errors surfaced by the kernels. These are programming or data errors the
/// host must handle; kernels never panic on user data.
#[derive(Debug)]
pub enum KernelError {
    TypeMismatch {
        expected: TypeId,
        actual: TypeId,
    },
    SizeMismatch {
        left: usize,
        right: usize,
    },
    /// The requested kernel has no implementation for the input type.
    UnsupportedType {
        op: &'static str,
        type_id: TypeId,
    },
    /// A constant operand does not match the vector's type.
    ConstantTypeMismatch {
        type_id: TypeId,
    },
    /// A varchar element failed to parse as the cast target at `position`.
    CastFailure {
        position: usize,
        target: TypeId,
    },
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::TypeMismatch { expected, actual } => {
                write!(f, "expected {expected} vector, got {actual}")
            }
            KernelError::SizeMismatch { left, right } => {
                write!(f, "input sizes differ: {left} vs {right}")
            }
            KernelError::UnsupportedType { op, type_id } => {
                write!(f, "{op} is not supported on {type_id} vectors")
            }
            KernelError::ConstantTypeMismatch { type_id } => {
                write!(f, "constant does not match {type_id} vector")
            }
            KernelError::CastFailure { position, target } => {
                write!(f, "value at position {position} cannot be cast to {target}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

pub(crate) fn check_same_type(
    left: &crate::exec::Vector,
    right: &crate::exec::Vector,
) -> Result<(), KernelError> {
    if left.type_id() != right.type_id() {
        return Err(KernelError::TypeMismatch {
            expected: left.type_id(),
            actual: right.type_id(),
        });
    }
    Ok(())
}

pub(crate) fn check_same_size(
    left: &crate::exec::Vector,
    right: &crate::exec::Vector,
) -> Result<(), KernelError> {
    if left.size() != right.size() {
        return Err(KernelError::SizeMismatch {
            left: left.size(),
            right: right.size(),
        });
    }
    Ok(())
}

/// Prepares `result` to mirror `input`'s shape: same total size, same filter
/// list, with an all-clear null mask. Must run before the inner loop writes.
pub(crate) fn prepare_result(input: &crate::exec::Vector, result: &mut crate::exec::Vector) {
    result.resize(input.size());
    result.null_mask_mut().reset();
    result.set_filter(input.filter().cloned());
}
