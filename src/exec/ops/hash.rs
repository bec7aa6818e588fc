//! Hashing kernels. Every position gets a 64-bit hash; NULL positions hash
//! to a fixed sentinel so grouping treats all NULLs as one key.

use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;
use once_cell::sync::Lazy;

use crate::exec::vector::Elem;
use crate::exec::Vector;
use crate::types::{Date, HashVal, Timestamp, TypeId, VarlenEntry};

use super::{prepare_result, KernelError};

/// Hash assigned to NULL positions.
pub const NULL_HASH: HashVal = 0;

// Fixed seeds keep hashes stable across processes, which partitioned
// aggregation relies on when merging spill partitions built by different
// workers.
static HASH_STATE: Lazy<RandomState> =
    Lazy::new(|| RandomState::with_seeds(0x8e3c_63ce, 0x5f1b_2d4a, 0x1759_91cb, 0x0b4c_a1d3));

/// Hashes one value with the engine-wide fixed-seed hasher.
#[inline]
pub fn hash_scalar<T: Hash>(value: &T) -> HashVal {
    let mut hasher = HASH_STATE.build_hasher();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Folds `new` into an existing hash accumulator. The mix is
/// order-sensitive and avalanches.
#[inline]
pub fn combine(seed: HashVal, new: HashVal) -> HashVal {
    seed ^ new
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

trait HashElem: Elem {
    fn hash_elem(&self) -> HashVal;
}

macro_rules! impl_hash_elem {
    ($($ty:ty),+) => {
        $(impl HashElem for $ty {
            #[inline]
            fn hash_elem(&self) -> HashVal {
                hash_scalar(self)
            }
        })+
    };
}

impl_hash_elem!(bool, i8, i16, i32, i64, u64, usize, Date, Timestamp);

impl HashElem for f32 {
    #[inline]
    fn hash_elem(&self) -> HashVal {
        hash_scalar(&self.to_bits())
    }
}

impl HashElem for f64 {
    #[inline]
    fn hash_elem(&self) -> HashVal {
        hash_scalar(&self.to_bits())
    }
}

impl HashElem for VarlenEntry {
    #[inline]
    fn hash_elem(&self) -> HashVal {
        hash_scalar(&self.as_bytes())
    }
}

fn templated_hash<T: HashElem>(input: &Vector, result: &mut Vector) {
    let values = input.values::<T>();
    let out = result.values_mut::<HashVal>().as_mut_ptr();
    input.for_each_active(|i| {
        let hash = if input.null_mask().test(i) {
            NULL_HASH
        } else {
            values[i].hash_elem()
        };
        unsafe { *out.add(i) = hash };
    });
}

fn templated_hash_combine<T: HashElem>(input: &Vector, result: &mut Vector) {
    let values = input.values::<T>();
    let out = result.values_mut::<HashVal>().as_mut_ptr();
    input.for_each_active(|i| {
        let hash = if input.null_mask().test(i) {
            NULL_HASH
        } else {
            values[i].hash_elem()
        };
        unsafe { *out.add(i) = combine(*out.add(i), hash) };
    });
}

macro_rules! dispatch_hashable {
    ($type_id:expr, $macro_body:ident!($($args:tt)*)) => {
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
            other => {
                return Err(KernelError::UnsupportedType {
                    op: "hash",
                    type_id: other,
                })
            }
        }
    };
}

fn check_hash_output(result: &Vector) -> Result<(), KernelError> {
    if result.type_id() != TypeId::Hash {
        return Err(KernelError::TypeMismatch {
            expected: TypeId::Hash,
            actual: result.type_id(),
        });
    }
    Ok(())
}

/// `result[i] = hash(input[i])`; NULL positions hash to [`NULL_HASH`].
pub fn hash(input: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_hash_output(result)?;
    prepare_result(input, result);

    macro_rules! run {
        ($ty:ty, $input:expr, $result:expr) => {
            templated_hash::<$ty>($input, $result)
        };
    }
    dispatch_hashable!(input.type_id(), run!(input, result));
    Ok(())
}

/// `result[i] = combine(result[i], hash(input[i]))`. The result vector must
/// already hold the accumulated hashes of the previous key columns.
pub fn hash_combine(input: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    check_hash_output(result)?;
    if result.size() != input.size() {
        return Err(KernelError::SizeMismatch {
            left: input.size(),
            right: result.size(),
        });
    }
    result.set_filter(input.filter().cloned());

    macro_rules! run {
        ($ty:ty, $input:expr, $result:expr) => {
            templated_hash_combine::<$ty>($input, $result)
        };
    }
    dispatch_hashable!(input.type_id(), run!(input, result));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_order_sensitive() {
        let a = hash_scalar(&1i64);
        let b = hash_scalar(&2i64);
        assert_ne!(combine(combine(0, a), b), combine(combine(0, b), a));
    }

    #[test]
    fn scalar_hash_is_stable() {
        assert_eq!(hash_scalar(&42i64), hash_scalar(&42i64));
        assert_ne!(hash_scalar(&42i64), hash_scalar(&43i64));
    }
}
