//! Comparison kernels producing boolean vectors.
//!
//! Three forms: vector-vector, vector-constant and constant-vector. The
//! result has the input's size and filter; a NULL on either side of a
//! position yields NULL at that position. String comparisons go through
//! [`VarlenEntry`]'s prefix-first ordering.

use crate::exec::vector::Elem;
use crate::exec::Vector;
use crate::types::{Date, Timestamp, TypeId, Val, VarlenEntry};

use super::{check_same_size, check_same_type, prepare_result, KernelError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpKind {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
}

impl CmpKind {
    /// The kind that yields the same result with swapped operands.
    pub fn flipped(self) -> CmpKind {
        match self {
            CmpKind::Equal => CmpKind::Equal,
            CmpKind::NotEqual => CmpKind::NotEqual,
            CmpKind::LessThan => CmpKind::GreaterThan,
            CmpKind::LessThanEqual => CmpKind::GreaterThanEqual,
            CmpKind::GreaterThan => CmpKind::LessThan,
            CmpKind::GreaterThanEqual => CmpKind::LessThanEqual,
        }
    }

    #[inline]
    pub(crate) fn apply<T: PartialOrd>(self, lhs: &T, rhs: &T) -> bool {
        match self {
            CmpKind::Equal => lhs == rhs,
            CmpKind::NotEqual => lhs != rhs,
            CmpKind::LessThan => lhs < rhs,
            CmpKind::LessThanEqual => lhs <= rhs,
            CmpKind::GreaterThan => lhs > rhs,
            CmpKind::GreaterThanEqual => lhs >= rhs,
        }
    }
}

impl std::fmt::Display for CmpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            CmpKind::Equal => "==",
            CmpKind::NotEqual => "!=",
            CmpKind::LessThan => "<",
            CmpKind::LessThanEqual => "<=",
            CmpKind::GreaterThan => ">",
            CmpKind::GreaterThanEqual => ">=",
        };
        f.write_str(symbol)
    }
}

/// Extracts a typed constant from `val`, or reports a mismatch. String
/// constants borrow `val`'s bytes, so the returned entry must not outlive the
/// kernel call.
pub(crate) fn val_as<T: Elem + FromVal>(val: &Val) -> Result<T, KernelError> {
    T::from_val(val).ok_or(KernelError::ConstantTypeMismatch {
        type_id: val.type_id().unwrap_or(TypeId::Boolean),
    })
}

pub(crate) trait FromVal: Sized {
    fn from_val(val: &Val) -> Option<Self>;
}

macro_rules! impl_from_val {
    ($ty:ty, $variant:ident) => {
        impl FromVal for $ty {
            fn from_val(val: &Val) -> Option<Self> {
                match val {
                    Val::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }
    };
}

impl_from_val!(bool, Boolean);
impl_from_val!(i8, TinyInt);
impl_from_val!(i16, SmallInt);
impl_from_val!(i32, Integer);
impl_from_val!(i64, BigInt);
impl_from_val!(f32, Float);
impl_from_val!(f64, Double);
impl_from_val!(Date, Date);
impl_from_val!(Timestamp, Timestamp);
impl_from_val!(u64, Hash);
impl_from_val!(usize, Pointer);

impl FromVal for VarlenEntry {
    fn from_val(val: &Val) -> Option<Self> {
        match val {
            // Borrows the string's bytes; valid for the duration of the call.
            Val::Varchar(s) if s.len() <= crate::types::varlen::INLINE_CAP => {
                Some(VarlenEntry::inline(s.as_bytes()))
            }
            Val::Varchar(s) => Some(VarlenEntry::from_ptr(s.as_ptr(), s.len())),
            _ => None,
        }
    }
}

fn templated_compare<T: Elem + PartialOrd>(
    kind: CmpKind,
    left: &Vector,
    right: &Vector,
    result: &mut Vector,
) {
    let lhs = left.values::<T>();
    let rhs = right.values::<T>();
    // Write through the raw pointer: `result` was resized to match and the
    // borrow of its bool slice cannot overlap the inputs.
    let out = result.values_mut::<bool>().as_mut_ptr();
    left.for_each_active(|i| unsafe {
        *out.add(i) = kind.apply(&lhs[i], &rhs[i]);
    });
}

fn templated_compare_val<T: Elem + PartialOrd>(
    kind: CmpKind,
    left: &Vector,
    constant: T,
    result: &mut Vector,
) {
    let lhs = left.values::<T>();
    let out = result.values_mut::<bool>().as_mut_ptr();
    left.for_each_active(|i| unsafe {
        *out.add(i) = kind.apply(&lhs[i], &constant);
    });
}

macro_rules! dispatch_comparable {
    ($type_id:expr, $op:literal, $macro_body:ident!($($args:tt)*)) => {
        match $type_id {
            TypeId::Boolean => $macro_body!(bool, $($args)*),
            TypeId::TinyInt => $macro_body!(i8, $($args)*),
            TypeId::SmallInt => $macro_body!(i16, $($args)*),
            TypeId::Integer => $macro_body!(i32, $($args)*),
            TypeId::BigInt => $macro_body!(i64, $($args)*),
            TypeId::Float => $macro_body!(f32, $($args)*),
            TypeId::Double => $macro_body!(f64, $($args)*),
            TypeId::Date => $macro_body!(Date, $($args)*),
            TypeId::Timestamp => $macro_body!(Timestamp, $($args)*),
            TypeId::Varchar | TypeId::Varbinary => $macro_body!(VarlenEntry, $($args)*),
            TypeId::Hash => $macro_body!(u64, $($args)*),
            TypeId::Pointer => $macro_body!(usize, $($args)*),
        }
    };
}

pub(crate) use dispatch_comparable;

/// `result[i] = left[i] <kind> right[i]`, NULL-propagating.
pub fn compare(
    kind: CmpKind,
    left: &Vector,
    right: &Vector,
    result: &mut Vector,
) -> Result<(), KernelError> {
    check_same_type(left, right)?;
    check_same_size(left, right)?;
    check_bool_output(result)?;

    prepare_result(left, result);
    result.null_mask_mut().copy_from(left.null_mask());
    result.null_mask_mut().union(right.null_mask());

    macro_rules! run {
        ($ty:ty, $kind:expr, $left:expr, $right:expr, $result:expr) => {
            templated_compare::<$ty>($kind, $left, $right, $result)
        };
    }
    dispatch_comparable!(left.type_id(), "compare", run!(kind, left, right, result));
    Ok(())
}

/// `result[i] = left[i] <kind> constant`, NULL-propagating. A NULL constant
/// makes every position NULL.
pub fn compare_val(
    kind: CmpKind,
    left: &Vector,
    constant: &Val,
    result: &mut Vector,
) -> Result<(), KernelError> {
    check_bool_output(result)?;
    prepare_result(left, result);

    if constant.is_null() {
        result.null_mask_mut().set_all();
        return Ok(());
    }
    result.null_mask_mut().copy_from(left.null_mask());

    macro_rules! run {
        ($ty:ty, $kind:expr, $left:expr, $constant:expr, $result:expr) => {
            templated_compare_val::<$ty>($kind, $left, val_as::<$ty>($constant)?, $result)
        };
    }
    dispatch_comparable!(left.type_id(), "compare", run!(kind, left, constant, result));
    Ok(())
}

/// `result[i] = constant <kind> right[i]`, NULL-propagating.
pub fn val_compare(
    kind: CmpKind,
    constant: &Val,
    right: &Vector,
    result: &mut Vector,
) -> Result<(), KernelError> {
    compare_val(kind.flipped(), right, constant, result)
}

fn check_bool_output(result: &Vector) -> Result<(), KernelError> {
    if result.type_id() != TypeId::Boolean {
        return Err(KernelError::TypeMismatch {
            expected: TypeId::Boolean,
            actual: result.type_id(),
        });
    }
    Ok(())
}
