//! Arithmetic kernels. Integer operations wrap two's-complement; floats
//! follow IEEE-754. Division or remainder by zero never faults; the output
//! position becomes NULL instead.

use crate::exec::vector::Elem;
use crate::exec::Vector;
use crate::types::{TypeId, Val};

use super::compare::val_as;
use super::{check_same_size, check_same_type, prepare_result, KernelError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithKind {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Element types arithmetic runs over.
pub(crate) trait ArithElem: Elem {
    fn add(lhs: Self, rhs: Self) -> Self;
    fn sub(lhs: Self, rhs: Self) -> Self;
    fn mul(lhs: Self, rhs: Self) -> Self;
    /// `None` when `rhs` is zero.
    fn div(lhs: Self, rhs: Self) -> Option<Self>;
    /// `None` when `rhs` is zero.
    fn rem(lhs: Self, rhs: Self) -> Option<Self>;
    fn neg(value: Self) -> Self;
}

macro_rules! impl_arith_int {
    ($($ty:ty),+) => {
        $(impl ArithElem for $ty {
            #[inline] fn add(l: Self, r: Self) -> Self { l.wrapping_add(r) }
            #[inline] fn sub(l: Self, r: Self) -> Self { l.wrapping_sub(r) }
            #[inline] fn mul(l: Self, r: Self) -> Self { l.wrapping_mul(r) }
            #[inline] fn div(l: Self, r: Self) -> Option<Self> {
                (r != 0).then(|| l.wrapping_div(r))
            }
            #[inline] fn rem(l: Self, r: Self) -> Option<Self> {
                (r != 0).then(|| l.wrapping_rem(r))
            }
            #[inline] fn neg(v: Self) -> Self { v.wrapping_neg() }
        })+
    };
}

macro_rules! impl_arith_float {
    ($($ty:ty),+) => {
        $(impl ArithElem for $ty {
            #[inline] fn add(l: Self, r: Self) -> Self { l + r }
            #[inline] fn sub(l: Self, r: Self) -> Self { l - r }
            #[inline] fn mul(l: Self, r: Self) -> Self { l * r }
            #[inline] fn div(l: Self, r: Self) -> Option<Self> {
                (r != 0.0).then(|| l / r)
            }
            #[inline] fn rem(l: Self, r: Self) -> Option<Self> {
                (r != 0.0).then(|| l % r)
            }
            #[inline] fn neg(v: Self) -> Self { -v }
        })+
    };
}

impl_arith_int!(i8, i16, i32, i64);
impl_arith_float!(f32, f64);

impl ArithKind {
    #[inline]
    fn apply<T: ArithElem>(self, lhs: T, rhs: T) -> Option<T> {
        match self {
            ArithKind::Add => Some(T::add(lhs, rhs)),
            ArithKind::Sub => Some(T::sub(lhs, rhs)),
            ArithKind::Mul => Some(T::mul(lhs, rhs)),
            ArithKind::Div => T::div(lhs, rhs),
            ArithKind::Rem => T::rem(lhs, rhs),
        }
    }
}

fn templated_arith<T: ArithElem>(kind: ArithKind, left: &Vector, right: &Vector, result: &mut Vector) {
    let lhs = left.values::<T>();
    let rhs = right.values::<T>();
    let out = result.values_mut::<T>().as_mut_ptr();
    let mut faults = Vec::new();
    left.for_each_active(|i| match kind.apply(lhs[i], rhs[i]) {
        Some(value) => unsafe { *out.add(i) = value },
        None => faults.push(i),
    });
    for i in faults {
        result.null_mask_mut().set(i);
    }
}

fn templated_arith_val<T: ArithElem>(
    kind: ArithKind,
    left: &Vector,
    constant: T,
    constant_on_left: bool,
    result: &mut Vector,
) {
    let lhs = left.values::<T>();
    let out = result.values_mut::<T>().as_mut_ptr();
    let mut faults = Vec::new();
    left.for_each_active(|i| {
        let outcome = if constant_on_left {
            kind.apply(constant, lhs[i])
        } else {
            kind.apply(lhs[i], constant)
        };
        match outcome {
            Some(value) => unsafe { *out.add(i) = value },
            None => faults.push(i),
        }
    });
    for i in faults {
        result.null_mask_mut().set(i);
    }
}

macro_rules! dispatch_numeric {
    ($type_id:expr, $op:literal, $macro_body:ident!($($args:tt)*)) => {
        match $type_id {
            TypeId::TinyInt => $macro_body!(i8, $($args)*),
            TypeId::SmallInt => $macro_body!(i16, $($args)*),
            TypeId::Integer => $macro_body!(i32, $($args)*),
            TypeId::BigInt => $macro_body!(i64, $($args)*),
            TypeId::Float => $macro_body!(f32, $($args)*),
            TypeId::Double => $macro_body!(f64, $($args)*),
            other => {
                return Err(KernelError::UnsupportedType {
                    op: $op,
                    type_id: other,
                })
            }
        }
    };
}

fn check_arith_output(left: &Vector, result: &Vector) -> Result<(), KernelError> {
    if result.type_id() != left.type_id() {
        return Err(KernelError::TypeMismatch {
            expected: left.type_id(),
            actual: result.type_id(),
        });
    }
    Ok(())
}

/// `result[i] = left[i] <kind> right[i]`, NULL-propagating; division by zero
/// NULLs the position.
pub fn arithmetic(
    kind: ArithKind,
    left: &Vector,
    right: &Vector,
    result: &mut Vector,
) -> Result<(), KernelError> {
    check_same_type(left, right)?;
    check_same_size(left, right)?;
    check_arith_output(left, result)?;

    prepare_result(left, result);
    result.null_mask_mut().copy_from(left.null_mask());
    result.null_mask_mut().union(right.null_mask());

    macro_rules! run {
        ($ty:ty, $kind:expr, $left:expr, $right:expr, $result:expr) => {
            templated_arith::<$ty>($kind, $left, $right, $result)
        };
    }
    dispatch_numeric!(left.type_id(), "arithmetic", run!(kind, left, right, result));
    Ok(())
}

/// `result[i] = left[i] <kind> constant`.
pub fn arithmetic_val(
    kind: ArithKind,
    left: &Vector,
    constant: &Val,
    result: &mut Vector,
) -> Result<(), KernelError> {
    arithmetic_val_impl(kind, left, constant, false, result)
}

/// `result[i] = constant <kind> right[i]`.
pub fn val_arithmetic(
    kind: ArithKind,
    constant: &Val,
    right: &Vector,
    result: &mut Vector,
) -> Result<(), KernelError> {
    arithmetic_val_impl(kind, right, constant, true, result)
}

fn arithmetic_val_impl(
    kind: ArithKind,
    vector: &Vector,
    constant: &Val,
    constant_on_left: bool,
    result: &mut Vector,
) -> Result<(), KernelError> {
    check_arith_output(vector, result)?;
    prepare_result(vector, result);

    if constant.is_null() {
        result.null_mask_mut().set_all();
        return Ok(());
    }
    result.null_mask_mut().copy_from(vector.null_mask());

    macro_rules! run {
        ($ty:ty, $kind:expr, $vector:expr, $constant:expr, $flip:expr, $result:expr) => {
            templated_arith_val::<$ty>($kind, $vector, val_as::<$ty>($constant)?, $flip, $result)
        };
    }
    dispatch_numeric!(
        vector.type_id(),
        "arithmetic",
        run!(kind, vector, constant, constant_on_left, result)
    );
    Ok(())
}

/// `result[i] = -input[i]`, NULL-propagating.
pub fn negate(input: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_arith_output(input, result)?;
    prepare_result(input, result);
    result.null_mask_mut().copy_from(input.null_mask());

    fn templated_neg<T: ArithElem>(input: &Vector, result: &mut Vector) {
        let values = input.values::<T>();
        let out = result.values_mut::<T>().as_mut_ptr();
        input.for_each_active(|i| unsafe { *out.add(i) = T::neg(values[i]) });
    }

    macro_rules! run {
        ($ty:ty, $input:expr, $result:expr) => {
            templated_neg::<$ty>($input, $result)
        };
    }
    dispatch_numeric!(input.type_id(), "negate", run!(input, result));
    Ok(())
}
