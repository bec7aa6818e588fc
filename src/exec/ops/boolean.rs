//! Boolean logic under SQL's three-valued semantics, plus the null-check and
//! any/all reduction kernels.
//!
//! Truth table corners: `NULL AND FALSE = FALSE`, `NULL OR TRUE = TRUE`,
//! everything else involving NULL stays NULL, and `NOT NULL = NULL`.

use crate::exec::Vector;
use crate::types::TypeId;

use super::{check_same_size, prepare_result, KernelError};

fn check_bool(vector: &Vector) -> Result<(), KernelError> {
    if vector.type_id() != TypeId::Boolean {
        return Err(KernelError::TypeMismatch {
            expected: TypeId::Boolean,
            actual: vector.type_id(),
        });
    }
    Ok(())
}

/// `result = left AND right` with three-valued NULL handling.
pub fn and(left: &Vector, right: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_bool(left)?;
    check_bool(right)?;
    check_bool(result)?;
    check_same_size(left, right)?;

    prepare_result(left, result);
    let lhs = left.values::<bool>();
    let rhs = right.values::<bool>();
    let out = result.values_mut::<bool>().as_mut_ptr();
    let mut nulls = Vec::new();
    left.for_each_active(|i| {
        let (l, r) = (lhs[i], rhs[i]);
        let (ln, rn) = (left.null_mask().test(i), right.null_mask().test(i));
        // NULL unless one side is a definite FALSE.
        if (ln && (rn || r)) || (rn && l) {
            nulls.push(i);
        }
        unsafe { *out.add(i) = !ln && !rn && l && r };
    });
    for i in nulls {
        result.null_mask_mut().set(i);
    }
    Ok(())
}

/// `result = left OR right` with three-valued NULL handling.
pub fn or(left: &Vector, right: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_bool(left)?;
    check_bool(right)?;
    check_bool(result)?;
    check_same_size(left, right)?;

    prepare_result(left, result);
    let lhs = left.values::<bool>();
    let rhs = right.values::<bool>();
    let out = result.values_mut::<bool>().as_mut_ptr();
    let mut nulls = Vec::new();
    left.for_each_active(|i| {
        let (l, r) = (lhs[i], rhs[i]);
        let (ln, rn) = (left.null_mask().test(i), right.null_mask().test(i));
        // NULL unless one side is a definite TRUE.
        if (ln && (rn || !r)) || (rn && !l) {
            nulls.push(i);
        }
        unsafe { *out.add(i) = (!ln && l) || (!rn && r) };
    });
    for i in nulls {
        result.null_mask_mut().set(i);
    }
    Ok(())
}

/// `result = NOT input`; NULL stays NULL.
pub fn not(input: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_bool(input)?;
    check_bool(result)?;

    prepare_result(input, result);
    result.null_mask_mut().copy_from(input.null_mask());
    let values = input.values::<bool>();
    let out = result.values_mut::<bool>().as_mut_ptr();
    input.for_each_active(|i| unsafe { *out.add(i) = !values[i] });
    Ok(())
}

/// `result[i] = input[i] IS NULL`. The result never contains NULLs.
pub fn is_null(input: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_bool(result)?;
    prepare_result(input, result);
    let out = result.values_mut::<bool>().as_mut_ptr();
    input.for_each_active(|i| unsafe { *out.add(i) = input.null_mask().test(i) });
    Ok(())
}

/// `result[i] = input[i] IS NOT NULL`. The result never contains NULLs.
pub fn is_not_null(input: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_bool(result)?;
    prepare_result(input, result);
    let out = result.values_mut::<bool>().as_mut_ptr();
    input.for_each_active(|i| unsafe { *out.add(i) = !input.null_mask().test(i) });
    Ok(())
}

/// True iff any live, non-null position holds TRUE. NULLs are ignored.
pub fn any_true(input: &Vector) -> Result<bool, KernelError> {
    check_bool(input)?;
    let values = input.values::<bool>();
    let mut any = false;
    input.for_each_active(|i| {
        any |= !input.null_mask().test(i) && values[i];
    });
    Ok(any)
}

/// True iff every live position is non-null TRUE; a NULL disqualifies.
pub fn all_true(input: &Vector) -> Result<bool, KernelError> {
    check_bool(input)?;
    let values = input.values::<bool>();
    let mut all = true;
    input.for_each_active(|i| {
        all &= !input.null_mask().test(i) && values[i];
    });
    Ok(all)
}
