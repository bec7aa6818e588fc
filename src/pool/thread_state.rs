//! Per-worker state slots for parallel pipelines.
//!
//! Each worker owns one opaque byte slot holding its thread-local structures
//! (a pre-aggregation hash table, a sorter, ...). Structures inside a slot
//! are addressed by byte offset, which is how bytecode-compiled pipelines
//! refer to them. After the parallel phase, the owning operator walks all
//! slots to merge the per-worker results.

use std::cell::UnsafeCell;

type InitFn<'a> = dyn Fn(*mut u8) + Send + Sync + 'a;
type DestroyFn<'a> = dyn Fn(*mut u8) + Send + Sync + 'a;

struct Slot {
    data: UnsafeCell<Box<[u8]>>,
}

/// Maps worker index to an owned, lazily-identical state slot. One worker
/// writes one slot; cross-slot access only happens after the parallel region
/// has joined, which is what makes the `Sync` below sound.
pub struct ThreadStateContainer<'a> {
    slots: Vec<Slot>,
    slot_size: usize,
    destroy: Option<Box<DestroyFn<'a>>>,
}

unsafe impl Send for ThreadStateContainer<'_> {}
unsafe impl Sync for ThreadStateContainer<'_> {}

impl<'a> ThreadStateContainer<'a> {
    pub fn new() -> Self {
        ThreadStateContainer {
            slots: Vec::new(),
            slot_size: 0,
            destroy: None,
        }
    }

    /// Tears down any existing slots, then builds `num_threads` fresh slots
    /// of `slot_size` zeroed bytes, running `init` on each.
    pub fn reset(
        &mut self,
        num_threads: usize,
        slot_size: usize,
        init: Option<Box<InitFn<'a>>>,
        destroy: Option<Box<DestroyFn<'a>>>,
    ) {
        self.clear();
        self.slot_size = slot_size;
        self.destroy = destroy;
        self.slots.reserve(num_threads);
        for _ in 0..num_threads {
            let slot = Slot {
                data: UnsafeCell::new(vec![0u8; slot_size].into_boxed_slice()),
            };
            if let Some(init) = &init {
                init(slot.data.get() as *mut u8);
            }
            self.slots.push(slot);
        }
    }

    pub fn num_threads(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Raw pointer to worker `thread_idx`'s slot.
    pub fn slot_ptr(&self, thread_idx: usize) -> *mut u8 {
        unsafe { (*self.slots[thread_idx].data.get()).as_mut_ptr() }
    }

    /// Typed access to the structure at `offset` inside worker
    /// `thread_idx`'s slot.
    ///
    /// # Safety
    /// The slot must hold an initialized `T` at `offset`, and the caller must
    /// not alias the same slot from two threads at once.
    pub unsafe fn state_at<T>(&self, thread_idx: usize, offset: usize) -> &mut T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.slot_size);
        &mut *(self.slot_ptr(thread_idx).add(offset) as *mut T)
    }

    /// Collects, for every slot, a raw pointer to the structure at `offset`.
    pub fn collect_element_ptrs(&self, offset: usize) -> Vec<*mut u8> {
        (0..self.slots.len())
            .map(|idx| unsafe { self.slot_ptr(idx).add(offset) })
            .collect()
    }

    /// Runs `f` over every slot pointer, single-threaded.
    pub fn for_each_slot(&self, mut f: impl FnMut(*mut u8)) {
        for idx in 0..self.slots.len() {
            f(self.slot_ptr(idx));
        }
    }

    pub fn clear(&mut self) {
        if let Some(destroy) = &self.destroy {
            for slot in &self.slots {
                destroy(slot.data.get() as *mut u8);
            }
        }
        self.slots.clear();
        self.slot_size = 0;
    }
}

impl Default for ThreadStateContainer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadStateContainer<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_independent_and_initialized() {
        let mut tsc = ThreadStateContainer::new();
        tsc.reset(
            4,
            8,
            Some(Box::new(|ptr| unsafe { (ptr as *mut u64).write(7) })),
            None,
        );
        assert_eq!(tsc.num_threads(), 4);
        for i in 0..4 {
            let value: &mut u64 = unsafe { tsc.state_at(i, 0) };
            assert_eq!(*value, 7);
            *value = i as u64;
        }
        let ptrs = tsc.collect_element_ptrs(0);
        for (i, ptr) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { *(*ptr as *const u64) }, i as u64);
        }
    }

    #[test]
    fn destroy_runs_on_reset_and_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let destroyed = AtomicUsize::new(0);
        {
            let mut tsc = ThreadStateContainer::new();
            tsc.reset(
                3,
                8,
                None,
                Some(Box::new(|_| {
                    destroyed.fetch_add(1, Ordering::Relaxed);
                })),
            );
            tsc.reset(2, 8, None, None);
            assert_eq!(destroyed.load(Ordering::Relaxed), 3);
        }
        assert_eq!(destroyed.load(Ordering::Relaxed), 3);
    }
}
