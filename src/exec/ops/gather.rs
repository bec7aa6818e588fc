//! Fused gather+select: dereference a vector of pointers at a byte offset,
//! compare the loaded element against a probe value, and prune the tuple-id
//! list to the matches. This is the key-check step of hash-join probing and
//! aggregation lookup.
//!
//! A simple scalar filter loop beats a masked SIMD gather here; the filter
//! runs only over live tuples and the loads are cache-resident after the
//! preceding chain walk.

use crate::exec::vector::Elem;
use crate::exec::{TupleIdList, Vector};
use crate::types::{Date, Timestamp, TypeId, Val, VarlenEntry};

use super::compare::{dispatch_comparable, val_as, CmpKind};
use super::KernelError;

fn check_pointers(pointers: &Vector) -> Result<(), KernelError> {
    if pointers.type_id() != TypeId::Pointer {
        return Err(KernelError::TypeMismatch {
            expected: TypeId::Pointer,
            actual: pointers.type_id(),
        });
    }
    Ok(())
}

fn templated_gather_select<T: Elem + PartialOrd>(
    kind: CmpKind,
    input: &Vector,
    pointers: &Vector,
    offset: usize,
    tids: &mut TupleIdList,
) {
    let probe = input.values::<T>();
    let ptrs = pointers.values::<usize>();
    tids.filter(|i| {
        // Rows referenced by the pointer vector were materialized by this
        // engine; the offset is a compile-time payload layout offset.
        let element = unsafe { ((ptrs[i] + offset) as *const T).read_unaligned() };
        kind.apply(&element, &probe[i])
    });
}

fn templated_gather_select_val<T: Elem + PartialOrd>(
    kind: CmpKind,
    constant: T,
    pointers: &Vector,
    offset: usize,
    tids: &mut TupleIdList,
) {
    let ptrs = pointers.values::<usize>();
    tids.filter(|i| {
        let element = unsafe { ((ptrs[i] + offset) as *const T).read_unaligned() };
        kind.apply(&element, &constant)
    });
}

/// Keeps only tuples where `*(pointers[i] + offset) <kind> input[i]`. NULL
/// probe positions are removed first.
pub fn gather_select(
    kind: CmpKind,
    input: &Vector,
    pointers: &Vector,
    offset: usize,
    tids: &mut TupleIdList,
) -> Result<(), KernelError> {
    check_pointers(pointers)?;
    if input.size() != pointers.size() {
        return Err(KernelError::SizeMismatch {
            left: input.size(),
            right: pointers.size(),
        });
    }

    tids.subtract_bits(input.null_mask());

    macro_rules! run {
        ($ty:ty, $kind:expr, $input:expr, $pointers:expr, $offset:expr, $tids:expr) => {
            templated_gather_select::<$ty>($kind, $input, $pointers, $offset, $tids)
        };
    }
    dispatch_comparable!(
        input.type_id(),
        "gather_select",
        run!(kind, input, pointers, offset, tids)
    );
    Ok(())
}

/// Keeps only tuples where `*(pointers[i] + offset) <kind> constant`. A NULL
/// constant clears the list.
pub fn gather_select_val(
    kind: CmpKind,
    constant: &Val,
    pointers: &Vector,
    offset: usize,
    tids: &mut TupleIdList,
) -> Result<(), KernelError> {
    check_pointers(pointers)?;
    if constant.is_null() {
        tids.clear();
        return Ok(());
    }
    let type_id = constant.type_id().expect("non-null constant has a type");

    macro_rules! run {
        ($ty:ty, $kind:expr, $constant:expr, $pointers:expr, $offset:expr, $tids:expr) => {
            templated_gather_select_val::<$ty>(
                $kind,
                val_as::<$ty>($constant)?,
                $pointers,
                $offset,
                $tids,
            )
        };
    }
    dispatch_comparable!(
        type_id,
        "gather_select",
        run!(kind, constant, pointers, offset, tids)
    );
    Ok(())
}
