//! Tuple sorting: append-only tuple storage, a bounded max-heap for top-k,
//! an in-place serial sort, and a parallel pipeline that sorts per-thread
//! runs, picks splitters by median-of-medians, and merges the resulting
//! buckets with per-bucket k-way heap merges.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::pool::{ThreadStateContainer, WorkerPool};
use crate::util::ChunkedVector;

/// Below this total, a parallel sort is not worth the scheduling overhead.
pub const MIN_TUPLES_FOR_PARALLEL_SORT: usize = 10_000;

/// Comparator over raw tuple buffers. Returns the ordering of `left`
/// relative to `right`.
pub type CompareFn = Arc<dyn Fn(*const u8, *const u8) -> Ordering + Send + Sync>;

/// The sorter: a chunked vector of fixed-size tuple buffers and a parallel
/// pointer array that is what actually gets reordered.
pub struct Sorter {
    tuple_size: usize,
    tuple_storage: ChunkedVector,
    /// Storage adopted from thread-local sorters after a parallel sort.
    owned_storage: Vec<ChunkedVector>,
    cmp: CompareFn,
    tuples: Vec<*mut u8>,
    sorted: bool,
}

unsafe impl Send for Sorter {}

impl Sorter {
    pub fn new(cmp: CompareFn, tuple_size: usize) -> Self {
        Sorter {
            tuple_size,
            tuple_storage: ChunkedVector::new(tuple_size),
            owned_storage: Vec::new(),
            cmp,
            tuples: Vec::new(),
            sorted: false,
        }
    }

    #[inline]
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    #[inline]
    pub fn tuple_count(&self) -> usize {
        self.tuples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    #[inline]
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// The `idx`-th tuple in current order.
    #[inline]
    pub fn tuple_at(&self, idx: usize) -> *const u8 {
        self.tuples[idx]
    }

    /// Iterates tuples in current order.
    pub fn iter(&self) -> impl Iterator<Item = *const u8> + '_ {
        self.tuples.iter().map(|&ptr| ptr as *const u8)
    }

    /// Appends a zero-initialized tuple buffer and returns it for the caller
    /// to fill.
    pub fn alloc_input_tuple(&mut self) -> *mut u8 {
        let ptr = self.tuple_storage.append();
        self.tuples.push(ptr);
        ptr
    }

    /// Top-k variant of [`Sorter::alloc_input_tuple`]; allocation is
    /// identical, the bound is enforced by
    /// [`Sorter::alloc_input_tuple_top_k_finish`].
    pub fn alloc_input_tuple_top_k(&mut self, _top_k: usize) -> *mut u8 {
        self.alloc_input_tuple()
    }

    /// Completes a top-k insert: once `top_k` tuples are buffered a max-heap
    /// is built, and every later insert either replaces the heap maximum or
    /// is discarded.
    pub fn alloc_input_tuple_top_k_finish(&mut self, top_k: usize) {
        if self.tuples.len() < top_k {
            return;
        }

        // Exactly k buffered: heapify once.
        if self.tuples.len() == top_k {
            self.build_heap();
            return;
        }

        // One more than k: the newest tuple either displaces the current
        // maximum or is dropped.
        let last_insert = self.tuples.pop().unwrap();
        let heap_top = self.tuples[0];
        if (self.cmp)(last_insert, heap_top) != Ordering::Greater {
            self.tuples[0] = last_insert;
            self.heap_sift_down(0);
        }
    }

    fn build_heap(&mut self) {
        let len = self.tuples.len();
        for idx in (0..len / 2).rev() {
            self.heap_sift_down(idx);
        }
    }

    /// Restores the max-heap property below `start`. `tuples[start]` is
    /// treated as a scratch slot until the final write.
    fn heap_sift_down(&mut self, start: usize) {
        let size = self.tuples.len();
        let top = self.tuples[start];
        let mut idx = start;

        loop {
            let mut child = 2 * idx + 1;
            if child >= size {
                break;
            }
            if child + 1 < size
                && (self.cmp)(self.tuples[child], self.tuples[child + 1]) == Ordering::Less
            {
                child += 1;
            }
            if (self.cmp)(top, self.tuples[child]) != Ordering::Less {
                break;
            }
            self.tuples[idx] = self.tuples[child];
            idx = child;
        }

        self.tuples[idx] = top;
    }

    /// Sorts all buffered tuples in place. Idempotent.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        if self.tuples.is_empty() {
            self.sorted = true;
            return;
        }
        let cmp = Arc::clone(&self.cmp);
        self.tuples.sort_unstable_by(|&a, &b| cmp(a, b));
        self.sorted = true;
        debug!(tuples = self.tuples.len(), "serial sort complete");
    }

    /// Sorts the union of all thread-local sorters (each slot of `container`
    /// holds a `Sorter` at `sorter_offset`) into this sorter. Thread-local
    /// instances surrender their tuple storage and come back empty.
    pub fn sort_parallel(
        &mut self,
        container: &ThreadStateContainer<'_>,
        sorter_offset: usize,
        pool: &WorkerPool,
    ) {
        let mut locals: Vec<*mut Sorter> = Vec::new();
        for thread_idx in 0..container.num_threads() {
            let sorter: &mut Sorter = unsafe { container.state_at(thread_idx, sorter_offset) };
            if !sorter.is_empty() {
                locals.push(sorter);
            }
        }

        if locals.is_empty() {
            self.sorted = true;
            return;
        }

        let num_tuples: usize = locals
            .iter()
            .map(|&sorter| unsafe { (*sorter).tuple_count() })
            .sum();

        // Small inputs: pull everything into this sorter and sort serially.
        if locals.len() == 1 || num_tuples < MIN_TUPLES_FOR_PARALLEL_SORT {
            debug!(tuples = num_tuples, "below parallel threshold, serial sort");
            self.tuples.reserve(num_tuples);
            for &local in &locals {
                let local = unsafe { &mut *local };
                self.tuples.extend_from_slice(&local.tuples);
                local.tuples.clear();
                self.adopt_storage(local);
            }
            self.sort();
            return;
        }

        // Stage one: sort each thread-local run in parallel.
        {
            struct LocalPtr(*mut Sorter);
            unsafe impl Send for LocalPtr {}
            let tasks: Vec<Box<dyn FnOnce() + Send + '_>> = locals
                .iter()
                .map(|&ptr| {
                    let local = LocalPtr(ptr);
                    let task: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                        let local = local;
                        unsafe { &mut *local.0 }.sort();
                    });
                    task
                })
                .collect();
            pool.run_tasks(tasks);
        }

        let locals: Vec<&mut Sorter> = locals
            .into_iter()
            .map(|ptr| unsafe { &mut *ptr })
            .collect();

        // Stage two: candidate splitters. For B output buckets, pick B-1
        // evenly spaced keys from every sorted run; the per-row median of
        // those candidates is the bucket boundary.
        let num_buckets = locals.len();
        let num_splitters = num_buckets - 1;
        let mut splitters: Vec<Vec<*mut u8>> = vec![vec![std::ptr::null_mut(); locals.len()]; num_splitters];
        for (sorter_idx, local) in locals.iter().enumerate() {
            let part_size = local.tuple_count() / (num_splitters + 1);
            for (splitter_idx, row) in splitters.iter_mut().enumerate() {
                let pick = ((splitter_idx + 1) * part_size).min(local.tuple_count() - 1);
                row[sorter_idx] = local.tuples[pick];
            }
        }

        // Stage three: carve each run into per-bucket input ranges bounded
        // by the splitters, tracking the running write position.
        struct MergeWork<'a> {
            inputs: Vec<&'a [*mut u8]>,
            destination: &'a mut [*mut u8],
        }
        unsafe impl Send for MergeWork<'_> {}

        self.tuples.clear();
        self.tuples.resize(num_tuples, std::ptr::null_mut());

        let cmp = Arc::clone(&self.cmp);
        let mut merge_work: Vec<MergeWork<'_>> = Vec::with_capacity(num_splitters);
        {
            let mut remaining: &mut [*mut u8] = &mut self.tuples;
            let mut next_start: Vec<usize> = vec![0; locals.len()];

            for (splitter_idx, row) in splitters.iter_mut().enumerate() {
                row.sort_unstable_by(|&a, &b| cmp(a, b));
                let splitter = row[locals.len() / 2];

                let mut input_ranges = Vec::new();
                let mut part_size = 0usize;
                for (sorter_idx, local) in locals.iter().enumerate() {
                    let start = next_start[sorter_idx];
                    let end = if splitter_idx < num_splitters - 1 {
                        // First position strictly greater than the splitter.
                        start
                            + local.tuples[start..]
                                .partition_point(|&t| cmp(t, splitter) != Ordering::Greater)
                    } else {
                        local.tuple_count()
                    };
                    if start != end {
                        input_ranges.push(&local.tuples[start..end]);
                    }
                    part_size += end - start;
                    next_start[sorter_idx] = end;
                }

                let (destination, rest) = remaining.split_at_mut(part_size);
                remaining = rest;
                merge_work.push(MergeWork {
                    inputs: input_ranges,
                    destination,
                });
            }
            debug_assert!(remaining.is_empty(), "merge packages must cover the output");
        }

        // Stage four: per-bucket k-way heap merges, work-stolen off the pool.
        let tasks: Vec<Box<dyn FnOnce() + Send + '_>> = merge_work
            .into_iter()
            .map(|work| {
                let cmp = Arc::clone(&self.cmp);
                let task: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                    let work = work;
                    merge_ranges(work.inputs, work.destination, &cmp);
                });
                task
            })
            .collect();
        pool.run_tasks(tasks);

        // Stage five: take ownership of every run's tuple storage.
        for local in locals {
            local.tuples.clear();
            self.adopt_storage(local);
        }

        self.sorted = true;
        debug!(tuples = num_tuples, buckets = num_buckets, "parallel sort complete");
    }

    /// Parallel sort followed by trimming to the `top_k` smallest tuples.
    pub fn sort_top_k_parallel(
        &mut self,
        container: &ThreadStateContainer<'_>,
        sorter_offset: usize,
        top_k: usize,
        pool: &WorkerPool,
    ) {
        self.sort_parallel(container, sorter_offset, pool);
        if top_k < self.tuples.len() {
            self.tuples.truncate(top_k);
        }
    }

    fn adopt_storage(&mut self, other: &mut Sorter) {
        let mut adopted = ChunkedVector::new(self.tuple_size);
        std::mem::swap(&mut adopted, &mut other.tuple_storage);
        self.owned_storage.push(adopted);
        self.owned_storage.append(&mut other.owned_storage);
    }
}

/// K-way merge of sorted `inputs` into `destination` using a min-heap of
/// range heads. `destination` is exactly the total input length.
fn merge_ranges(inputs: Vec<&[*mut u8]>, destination: &mut [*mut u8], cmp: &CompareFn) {
    debug_assert_eq!(
        inputs.iter().map(|r| r.len()).sum::<usize>(),
        destination.len()
    );

    // (range index, cursor) pairs arranged as a binary min-heap keyed by the
    // tuple each cursor points at.
    let mut heap: Vec<(usize, usize)> = Vec::with_capacity(inputs.len());

    let less = |a: (usize, usize), b: (usize, usize)| -> bool {
        cmp(inputs[a.0][a.1], inputs[b.0][b.1]) == Ordering::Less
    };

    let sift_up = |heap: &mut Vec<(usize, usize)>, mut idx: usize| {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if less(heap[idx], heap[parent]) {
                heap.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    };

    let sift_down = |heap: &mut Vec<(usize, usize)>, mut idx: usize| {
        loop {
            let mut smallest = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < heap.len() && less(heap[child], heap[smallest]) {
                    smallest = child;
                }
            }
            if smallest == idx {
                break;
            }
            heap.swap(idx, smallest);
            idx = smallest;
        }
    };

    for range_idx in 0..inputs.len() {
        heap.push((range_idx, 0));
        let last = heap.len() - 1;
        sift_up(&mut heap, last);
    }

    let mut write_idx = 0;
    while let Some(&(range_idx, cursor)) = heap.first() {
        destination[write_idx] = inputs[range_idx][cursor];
        write_idx += 1;

        if cursor + 1 < inputs[range_idx].len() {
            heap[0] = (range_idx, cursor + 1);
        } else {
            let last = heap.pop().unwrap();
            if heap.is_empty() {
                continue;
            }
            heap[0] = last;
        }
        sift_down(&mut heap, 0);
    }
    debug_assert_eq!(write_idx, destination.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i64_cmp() -> CompareFn {
        Arc::new(|a, b| {
            let left = unsafe { (a as *const i64).read_unaligned() };
            let right = unsafe { (b as *const i64).read_unaligned() };
            left.cmp(&right)
        })
    }

    fn push(sorter: &mut Sorter, value: i64) {
        let ptr = sorter.alloc_input_tuple();
        unsafe { (ptr as *mut i64).write_unaligned(value) };
    }

    fn collect(sorter: &Sorter) -> Vec<i64> {
        sorter
            .iter()
            .map(|ptr| unsafe { (ptr as *const i64).read_unaligned() })
            .collect()
    }

    #[test]
    fn serial_sort_orders_and_is_idempotent() {
        let mut sorter = Sorter::new(i64_cmp(), 8);
        for value in [5i64, 3, 9, 1, 7, 3] {
            push(&mut sorter, value);
        }
        sorter.sort();
        assert_eq!(collect(&sorter), vec![1, 3, 3, 5, 7, 9]);
        sorter.sort();
        assert_eq!(collect(&sorter), vec![1, 3, 3, 5, 7, 9]);
    }

    #[test]
    fn top_k_retains_the_k_smallest() {
        let mut sorter = Sorter::new(i64_cmp(), 8);
        // Descending insertion order is the adversarial case for the heap.
        for value in (0..100i64).rev() {
            let ptr = sorter.alloc_input_tuple_top_k(10);
            unsafe { (ptr as *mut i64).write_unaligned(value) };
            sorter.alloc_input_tuple_top_k_finish(10);
        }
        assert_eq!(sorter.tuple_count(), 10);
        sorter.sort();
        assert_eq!(collect(&sorter), (0..10i64).collect::<Vec<_>>());
    }

    #[test]
    fn merge_ranges_interleaves() {
        let a: Vec<i64> = vec![1, 4, 7];
        let b: Vec<i64> = vec![2, 5, 8];
        let c: Vec<i64> = vec![3, 6, 9];
        let as_ptrs = |v: &Vec<i64>| -> Vec<*mut u8> {
            v.iter().map(|x| x as *const i64 as *mut u8).collect()
        };
        let (pa, pb, pc) = (as_ptrs(&a), as_ptrs(&b), as_ptrs(&c));
        let mut dest = vec![std::ptr::null_mut(); 9];
        merge_ranges(
            vec![&pa, &pb, &pc],
            &mut dest,
            &i64_cmp(),
        );
        let merged: Vec<i64> = dest
            .iter()
            .map(|&p| unsafe { (p as *const i64).read_unaligned() })
            .collect();
        assert_eq!(merged, (1..=9).collect::<Vec<_>>());
    }
}
