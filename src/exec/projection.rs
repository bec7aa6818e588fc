//! An ordered bundle of vectors sharing one filter list, plus the iterator
//! the batch operators use to walk its live rows.

use std::sync::Arc;

use crate::exec::tid_list::TupleIdList;
use crate::exec::vector::{Elem, Vector, DEFAULT_VECTOR_SIZE};
use crate::types::TypeId;
use crate::util::mask::SelVal;

/// A projection over a fixed set of columns. In owning mode one contiguous
/// buffer is carved up among the child vectors; in referencing mode each
/// child is re-pointed at external column data per batch.
///
/// Invariant: all children report the same size and share the same filter
/// list object.
pub struct VectorProjection {
    vectors: Vec<Vector>,
    filter: Option<Arc<TupleIdList>>,
    /// Backing storage in owning mode. Boxed so child pointers stay stable
    /// when the projection moves.
    owned_buffer: Option<Box<[u8]>>,
}

impl VectorProjection {
    /// Creates an owning projection: one buffer partitioned among columns of
    /// the given types, each with [`DEFAULT_VECTOR_SIZE`] capacity.
    pub fn new_owning(types: &[TypeId]) -> Self {
        let mut offsets = Vec::with_capacity(types.len());
        let mut total = 0usize;
        for &type_id in types {
            let align = type_id.align();
            total = (total + align - 1) & !(align - 1);
            offsets.push(total);
            total += type_id.size() * DEFAULT_VECTOR_SIZE;
        }
        let mut buffer = vec![0u8; total.max(1)].into_boxed_slice();
        let base = buffer.as_mut_ptr();
        let vectors = types
            .iter()
            .zip(offsets)
            .map(|(&type_id, offset)| {
                let mut vector = unsafe {
                    Vector::new_referencing(type_id, base.wrapping_add(offset), DEFAULT_VECTOR_SIZE)
                };
                vector.resize(0);
                vector
            })
            .collect();
        VectorProjection {
            vectors,
            filter: None,
            owned_buffer: Some(buffer),
        }
    }

    /// Creates a referencing projection whose columns are installed per batch
    /// via [`VectorProjection::reference_column`].
    pub fn new_referencing(types: &[TypeId]) -> Self {
        VectorProjection {
            vectors: types.iter().map(|&t| Vector::new(t, 0)).collect(),
            filter: None,
            owned_buffer: None,
        }
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.vectors.len()
    }

    #[inline]
    pub fn column(&self, idx: usize) -> &Vector {
        &self.vectors[idx]
    }

    #[inline]
    pub fn column_mut(&mut self, idx: usize) -> &mut Vector {
        &mut self.vectors[idx]
    }

    /// Total tuples in the projection.
    pub fn total_tuple_count(&self) -> usize {
        self.vectors.first().map_or(0, Vector::size)
    }

    /// Live tuples after filtering.
    pub fn selected_tuple_count(&self) -> usize {
        self.vectors.first().map_or(0, Vector::count)
    }

    pub fn is_filtered(&self) -> bool {
        self.filter.is_some()
    }

    /// Whether this projection owns its column storage.
    pub fn is_owning(&self) -> bool {
        self.owned_buffer.is_some()
    }

    pub fn filter(&self) -> Option<&Arc<TupleIdList>> {
        self.filter.as_ref()
    }

    /// Clears all filters and sets every column to `num_elems` total tuples.
    pub fn reset(&mut self, num_elems: usize) {
        self.filter = None;
        for vector in &mut self.vectors {
            vector.resize(num_elems);
        }
        self.check_integrity();
    }

    /// Re-points column `idx` at external data.
    ///
    /// # Safety
    /// See [`Vector::new_referencing`].
    pub unsafe fn reference_column(&mut self, idx: usize, ptr: *mut u8, num_elems: usize) {
        let type_id = self.vectors[idx].type_id();
        self.vectors[idx] = Vector::new_referencing(type_id, ptr, num_elems);
    }

    /// Installs a shared filter across every column.
    pub fn set_filter(&mut self, list: TupleIdList) {
        debug_assert_eq!(list.capacity(), self.total_tuple_count());
        let shared = Arc::new(list);
        for vector in &mut self.vectors {
            vector.set_filter(Some(Arc::clone(&shared)));
        }
        self.filter = Some(shared);
        self.check_integrity();
    }

    /// Materializes the filter by compacting selected tuples into contiguous
    /// positions in every column, then drops the filter.
    pub fn pack(&mut self) {
        if self.filter.take().is_none() {
            return;
        }
        for vector in &mut self.vectors {
            vector.flatten();
        }
        self.check_integrity();
    }

    /// Verifies the cross-column invariants. Debug builds only.
    pub fn check_integrity(&self) {
        #[cfg(debug_assertions)]
        {
            if let Some(first) = self.vectors.first() {
                for vector in &self.vectors[1..] {
                    debug_assert_eq!(vector.size(), first.size(), "column sizes diverged");
                    debug_assert_eq!(vector.count(), first.count(), "column counts diverged");
                }
            }
            if let Some(filter) = &self.filter {
                for vector in &self.vectors {
                    let child = vector.filter().expect("filter missing on child");
                    debug_assert!(Arc::ptr_eq(child, filter), "child filter is a different list");
                }
            }
        }
    }
}

/// An iterator over the live rows of a projection.
///
/// When the projection is filtered, iteration order is the ascending
/// tuple-id order of the filter list; `set_position(k)` addresses the k-th
/// live row in that same order.
pub struct VectorProjectionIterator<'a> {
    projection: &'a VectorProjection,
    sel: [SelVal; DEFAULT_VECTOR_SIZE],
    num_selected: usize,
    filtered: bool,
    position: usize,
}

impl<'a> VectorProjectionIterator<'a> {
    pub fn new(projection: &'a VectorProjection) -> Self {
        assert!(
            projection.total_tuple_count() <= DEFAULT_VECTOR_SIZE,
            "projection exceeds one vector's worth of tuples"
        );
        let mut sel = [0 as SelVal; DEFAULT_VECTOR_SIZE];
        let (filtered, num_selected) = match projection.filter() {
            Some(list) => (true, list.to_selection_vector(&mut sel)),
            None => (false, projection.total_tuple_count()),
        };
        VectorProjectionIterator {
            projection,
            sel,
            num_selected,
            filtered,
            position: 0,
        }
    }

    #[inline]
    pub fn num_selected(&self) -> usize {
        self.num_selected
    }

    #[inline]
    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.position < self.num_selected
    }

    #[inline]
    pub fn advance(&mut self) {
        self.position += 1;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Jumps to the `k`-th live row.
    #[inline]
    pub fn set_position(&mut self, k: usize) {
        debug_assert!(k < self.num_selected);
        self.position = k;
    }

    /// Physical tuple id of the current row.
    #[inline]
    pub fn current_tuple_id(&self) -> usize {
        if self.filtered {
            self.sel[self.position] as usize
        } else {
            self.position
        }
    }

    /// Reads column `col` at the current row.
    #[inline]
    pub fn get<T: Elem>(&self, col: usize) -> T {
        self.projection.column(col).values::<T>()[self.current_tuple_id()]
    }

    /// Whether column `col` is NULL at the current row.
    #[inline]
    pub fn is_null(&self, col: usize) -> bool {
        self.projection.column(col).is_null(self.current_tuple_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_projection() -> VectorProjection {
        let mut vp = VectorProjection::new_owning(&[TypeId::BigInt, TypeId::Double]);
        vp.reset(6);
        for i in 0..6 {
            vp.column_mut(0).values_mut::<i64>()[i] = i as i64;
            vp.column_mut(1).values_mut::<f64>()[i] = i as f64 * 0.5;
        }
        vp
    }

    #[test]
    fn columns_share_filter_and_size() {
        let mut vp = filled_projection();
        assert_eq!(vp.total_tuple_count(), 6);
        assert_eq!(vp.selected_tuple_count(), 6);

        let mut list = TupleIdList::new(6);
        list.add(1);
        list.add(4);
        vp.set_filter(list);
        assert_eq!(vp.total_tuple_count(), 6);
        assert_eq!(vp.selected_tuple_count(), 2);
        assert_eq!(vp.column(0).count(), vp.column(1).count());
    }

    #[test]
    fn pack_materializes_selection() {
        let mut vp = filled_projection();
        let mut list = TupleIdList::new(6);
        list.add(0);
        list.add(2);
        list.add(5);
        vp.set_filter(list);
        vp.pack();
        assert!(!vp.is_filtered());
        assert_eq!(vp.total_tuple_count(), 3);
        assert_eq!(vp.column(0).values::<i64>(), &[0, 2, 5]);
        assert_eq!(vp.column(1).values::<f64>(), &[0.0, 1.0, 2.5]);
    }

    #[test]
    fn iterator_walks_live_rows() {
        let mut vp = filled_projection();
        let mut list = TupleIdList::new(6);
        list.add(1);
        list.add(3);
        list.add(5);
        vp.set_filter(list);

        let mut iter = VectorProjectionIterator::new(&vp);
        let mut seen = Vec::new();
        while iter.has_next() {
            seen.push(iter.get::<i64>(0));
            iter.advance();
        }
        assert_eq!(seen, vec![1, 3, 5]);

        iter.set_position(1);
        assert_eq!(iter.current_tuple_id(), 3);
        assert_eq!(iter.get::<f64>(1), 1.5);
    }
}
