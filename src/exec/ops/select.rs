//! Selection kernels: comparisons that prune a [`TupleIdList`] instead of
//! materializing a boolean vector. The surviving tuple ids stay in ascending
//! order; converting the list to a selection vector yields the matching
//! indexes and count.

use crate::exec::vector::Elem;
use crate::exec::{TupleIdList, Vector};
use crate::types::{Date, Timestamp, TypeId, Val, VarlenEntry};

use super::compare::{dispatch_comparable, val_as, CmpKind};
use super::{check_same_size, check_same_type, KernelError};

fn templated_select<T: Elem + PartialOrd>(
    kind: CmpKind,
    left: &Vector,
    right: &Vector,
    tids: &mut TupleIdList,
) {
    let lhs = left.values::<T>();
    let rhs = right.values::<T>();
    tids.filter(|i| kind.apply(&lhs[i], &rhs[i]));
}

fn templated_select_val<T: Elem + PartialOrd>(
    kind: CmpKind,
    left: &Vector,
    constant: T,
    tids: &mut TupleIdList,
) {
    let lhs = left.values::<T>();
    tids.filter(|i| kind.apply(&lhs[i], &constant));
}

/// Keeps only tuples where `left[i] <kind> right[i]`. NULL on either side
/// removes the tuple.
pub fn select(
    kind: CmpKind,
    left: &Vector,
    right: &Vector,
    tids: &mut TupleIdList,
) -> Result<(), KernelError> {
    check_same_type(left, right)?;
    check_same_size(left, right)?;

    tids.subtract_bits(left.null_mask());
    tids.subtract_bits(right.null_mask());

    macro_rules! run {
        ($ty:ty, $kind:expr, $left:expr, $right:expr, $tids:expr) => {
            templated_select::<$ty>($kind, $left, $right, $tids)
        };
    }
    dispatch_comparable!(left.type_id(), "select", run!(kind, left, right, tids));
    Ok(())
}

/// Keeps only tuples where `left[i] <kind> constant`. A NULL constant clears
/// the list.
pub fn select_val(
    kind: CmpKind,
    left: &Vector,
    constant: &Val,
    tids: &mut TupleIdList,
) -> Result<(), KernelError> {
    if constant.is_null() {
        tids.clear();
        return Ok(());
    }
    tids.subtract_bits(left.null_mask());

    macro_rules! run {
        ($ty:ty, $kind:expr, $left:expr, $constant:expr, $tids:expr) => {
            templated_select_val::<$ty>($kind, $left, val_as::<$ty>($constant)?, $tids)
        };
    }
    dispatch_comparable!(left.type_id(), "select", run!(kind, left, constant, tids));
    Ok(())
}
