//! The canonical "which rows are live" representation.

use crate::util::mask::{self, SelVal};
use crate::util::BitVector;

/// A set of tuple ids over a vector of fixed capacity, stored as a bit
/// vector. Enumeration is always in ascending tuple-id order.
#[derive(Clone, Debug)]
pub struct TupleIdList {
    bits: BitVector,
}

impl TupleIdList {
    /// An empty list over `capacity` tuple positions.
    pub fn new(capacity: usize) -> Self {
        TupleIdList {
            bits: BitVector::new(capacity),
        }
    }

    /// A full list: every tuple in `[0, capacity)` is live.
    pub fn new_full(capacity: usize) -> Self {
        let mut list = Self::new(capacity);
        list.bits.set_all();
        list
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.bits.num_bits()
    }

    /// Number of live tuples.
    #[inline]
    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.bits.any()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.bits.all()
    }

    /// Fraction of the capacity that is live, in `[0, 1]`.
    pub fn selectivity(&self) -> f64 {
        if self.capacity() == 0 {
            return 0.0;
        }
        self.len() as f64 / self.capacity() as f64
    }

    #[inline]
    pub fn contains(&self, tid: usize) -> bool {
        self.bits.test(tid)
    }

    #[inline]
    pub fn add(&mut self, tid: usize) {
        self.bits.set(tid);
    }

    pub fn add_all(&mut self) {
        self.bits.set_all();
    }

    /// Adds every tuple id in `[start, end)`.
    pub fn add_range(&mut self, start: usize, end: usize) {
        for tid in start..end {
            self.bits.set(tid);
        }
    }

    #[inline]
    pub fn remove(&mut self, tid: usize) {
        self.bits.unset(tid);
    }

    pub fn clear(&mut self) {
        self.bits.reset();
    }

    /// Resizes the list to a new capacity, clearing it.
    pub fn resize(&mut self, capacity: usize) {
        self.bits.resize(capacity);
    }

    pub fn union(&mut self, other: &TupleIdList) {
        self.bits.union(&other.bits);
    }

    pub fn intersect(&mut self, other: &TupleIdList) {
        self.bits.intersect(&other.bits);
    }

    pub fn difference(&mut self, other: &TupleIdList) {
        self.bits.difference(&other.bits);
    }

    /// Removes every live tuple whose bit is set in `mask` (used to strip
    /// NULL positions before a kernel runs).
    pub fn subtract_bits(&mut self, mask: &BitVector) {
        self.bits.difference(mask);
    }

    /// Retains only live tuples for which `keep` returns true. The predicate
    /// runs over live tuples in ascending order.
    pub fn filter(&mut self, keep: impl FnMut(usize) -> bool) {
        self.bits.update_set_bits(keep);
    }

    /// Iterates live tuple ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Writes live tuple ids into `sel` and returns the count.
    pub fn to_selection_vector(&self, sel: &mut [SelVal]) -> usize {
        mask::bit_vector_to_selection_vector(self.capacity(), self.bits.words(), sel)
    }

    /// Rebuilds the list from `m` ascending selection-vector entries.
    pub fn build_from_selection_vector(&mut self, sel: &[SelVal], m: usize) {
        self.bits.reset();
        for &tid in &sel[..m] {
            self.bits.set(tid as usize);
        }
    }
}

impl std::fmt::Display for TupleIdList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, tid) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{tid}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let mut list = TupleIdList::new(100);
        list.add(3);
        list.add(97);
        assert!(list.contains(3) && list.contains(97) && !list.contains(4));
        assert_eq!(list.len(), 2);
        list.remove(3);
        assert!(!list.contains(3));
    }

    #[test]
    fn selection_vector_round_trip() {
        let mut list = TupleIdList::new(2048);
        for tid in (0..2048).step_by(17) {
            list.add(tid);
        }
        let mut sel = [0 as SelVal; 2048];
        let count = list.to_selection_vector(&mut sel);
        assert_eq!(count, list.len());
        assert!(sel[..count].windows(2).all(|w| w[0] < w[1]));

        let mut rebuilt = TupleIdList::new(2048);
        rebuilt.build_from_selection_vector(&sel, count);
        assert_eq!(rebuilt.iter().collect::<Vec<_>>(), list.iter().collect::<Vec<_>>());
    }

    #[test]
    fn filter_and_selectivity() {
        let mut list = TupleIdList::new_full(1000);
        assert_eq!(list.selectivity(), 1.0);
        list.filter(|tid| tid % 4 == 0);
        assert_eq!(list.len(), 250);
        assert!((list.selectivity() - 0.25).abs() < 1e-9);
    }
}
