//! Broadcast and sequence-generation kernels.

use crate::exec::Vector;
use crate::types::{Date, Timestamp, TypeId, Val};

use super::KernelError;

/// Broadcasts `value` into every position of `vector`. A NULL value sets the
/// whole null mask instead.
pub fn fill(vector: &mut Vector, value: &Val) -> Result<(), KernelError> {
    if value.is_null() {
        vector.null_mask_mut().set_all();
        return Ok(());
    }
    vector.null_mask_mut().reset();
    for idx in 0..vector.size() {
        vector.set_value(idx, value);
    }
    Ok(())
}

/// Fills `vector[i] = start + i * step` over all positions, with the
/// vector's element-type semantics (integers wrap, floats round).
pub fn generate(vector: &mut Vector, start: i64, step: i64) -> Result<(), KernelError> {
    fn int_series<T>(vector: &mut Vector, start: i64, step: i64, narrow: impl Fn(i64) -> T)
    where
        T: crate::exec::vector::Elem,
    {
        let n = vector.size();
        let values = vector.values_mut::<T>();
        let mut acc = start;
        for slot in values.iter_mut().take(n) {
            *slot = narrow(acc);
            acc = acc.wrapping_add(step);
        }
    }

    vector.null_mask_mut().reset();
    match vector.type_id() {
        TypeId::TinyInt => int_series::<i8>(vector, start, step, |v| v as i8),
        TypeId::SmallInt => int_series::<i16>(vector, start, step, |v| v as i16),
        TypeId::Integer => int_series::<i32>(vector, start, step, |v| v as i32),
        TypeId::BigInt => int_series::<i64>(vector, start, step, |v| v),
        TypeId::Float => int_series::<f32>(vector, start, step, |v| v as f32),
        TypeId::Double => int_series::<f64>(vector, start, step, |v| v as f64),
        TypeId::Date => int_series::<Date>(vector, start, step, |v| Date(v as i32)),
        TypeId::Timestamp => int_series::<Timestamp>(vector, start, step, Timestamp),
        TypeId::Hash => int_series::<u64>(vector, start, step, |v| v as u64),
        other => {
            return Err(KernelError::UnsupportedType {
                op: "generate",
                type_id: other,
            })
        }
    }
    Ok(())
}
