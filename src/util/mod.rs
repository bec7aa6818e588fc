pub mod bit_vector;
pub mod chunked_vector;
pub mod mask;
pub mod region;

pub use bit_vector::BitVector;
pub use chunked_vector::ChunkedVector;
pub use region::Region;

/// Rounds `value` up to the next power of two, treating zero as one.
#[inline]
pub fn next_power_of_two(value: u64) -> u64 {
    value.max(1).next_power_of_two()
}

/// Rounds `value` down to the previous power of two, treating zero as one.
#[inline]
pub fn prev_power_of_two(value: u64) -> u64 {
    let value = value.max(1);
    1u64 << (63 - value.leading_zeros())
}
