//! Open-chained hash table over externally allocated entries.
//!
//! The directory is an array of tagged pointers: the low 48 bits hold the
//! chain-head address, the high 16 bits are a tiny per-slot bloom filter
//! seeded from the top hash bits, letting probes skip chains that cannot
//! contain the hash. Entries never move; they live in a [`ChunkedVector`]
//! owned by the embedding structure (aggregation or join table).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::HashVal;
use crate::util::next_power_of_two;

/// Default directory fill factor.
pub const DEFAULT_LOAD_FACTOR: f64 = 0.5;

const MIN_TABLE_SIZE: u64 = 64;

/// Low 48 bits of a slot: the chain-head pointer.
const POINTER_MASK: u64 = (1 << 48) - 1;
/// High 16 bits of a slot: the bloom tag.
const TAG_MASK: u64 = !POINTER_MASK;

/// The 16-byte header preceding every entry payload.
#[repr(C)]
pub struct HashTableEntry {
    pub hash: HashVal,
    pub next: *mut HashTableEntry,
}

impl HashTableEntry {
    pub const HEADER_SIZE: usize = std::mem::size_of::<HashTableEntry>();

    /// Reinterprets a raw chunked-vector element as an entry.
    ///
    /// # Safety
    /// `ptr` must address at least `HEADER_SIZE + payload` writable bytes.
    #[inline]
    pub unsafe fn from_raw<'a>(ptr: *mut u8) -> &'a mut HashTableEntry {
        &mut *(ptr as *mut HashTableEntry)
    }

    /// The opaque payload area following the header.
    #[inline]
    pub fn payload(&self) -> *mut u8 {
        unsafe { (self as *const HashTableEntry as *mut u8).add(Self::HEADER_SIZE) }
    }
}

#[inline]
fn tag_bit(hash: HashVal) -> u64 {
    // Top four hash bits select one of the sixteen tag bits.
    1u64 << (48 + (hash >> 60))
}

/// Open-chained, power-of-two-sized hash table with a bit-tagged directory.
/// Supports non-atomic inserts for single-thread builds and atomic inserts
/// for parallel builds; one mode is active per table at a time.
pub struct GenericHashTable {
    directory: Vec<AtomicU64>,
    mask: u64,
    num_elems: u64,
    load_factor: f64,
}

impl GenericHashTable {
    pub fn new(load_factor: f64) -> Self {
        GenericHashTable {
            directory: Vec::new(),
            mask: 0,
            num_elems: 0,
            load_factor,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.directory.len() as u64
    }

    #[inline]
    pub fn num_elements(&self) -> u64 {
        self.num_elems
    }

    #[inline]
    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// Directory memory footprint in bytes.
    pub fn total_memory_usage(&self) -> usize {
        self.directory.len() * std::mem::size_of::<AtomicU64>()
    }

    /// Sizes the directory for `expected_elems` entries at the configured
    /// load factor, discarding all current chains.
    pub fn set_size(&mut self, expected_elems: u64) {
        let size = next_power_of_two((expected_elems as f64 / self.load_factor).ceil() as u64)
            .max(MIN_TABLE_SIZE);
        self.directory = (0..size).map(|_| AtomicU64::new(0)).collect();
        self.mask = size - 1;
        self.num_elems = 0;
    }

    /// Pushes `entry` onto its chain. Single-writer only.
    pub fn insert(&mut self, entry: *mut HashTableEntry, hash: HashVal) {
        debug_assert!(!self.directory.is_empty(), "insert into unsized table");
        debug_assert_eq!(entry as u64 & TAG_MASK, 0, "entry above 48-bit space");
        let slot = &self.directory[(hash & self.mask) as usize];
        let old = slot.load(Ordering::Relaxed);
        unsafe {
            (*entry).next = (old & POINTER_MASK) as *mut HashTableEntry;
        }
        slot.store(
            (old & TAG_MASK) | tag_bit(hash) | entry as u64,
            Ordering::Relaxed,
        );
        self.num_elems += 1;
    }

    /// Pushes `entry` onto its chain with a compare-and-swap loop, safe for
    /// concurrent builders. The element count is fixed up by the caller via
    /// [`GenericHashTable::set_num_elements`] after the parallel region.
    pub fn insert_concurrent(&self, entry: *mut HashTableEntry, hash: HashVal) {
        debug_assert!(!self.directory.is_empty(), "insert into unsized table");
        let slot = &self.directory[(hash & self.mask) as usize];
        let mut old = slot.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*entry).next = (old & POINTER_MASK) as *mut HashTableEntry;
            }
            let new = (old & TAG_MASK) | tag_bit(hash) | entry as u64;
            match slot.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    pub fn set_num_elements(&mut self, num_elems: u64) {
        self.num_elems = num_elems;
    }

    /// Head of the chain that may contain `hash`, or null. The tag check
    /// filters definite misses without touching the chain.
    #[inline]
    pub fn find_chain_head(&self, hash: HashVal) -> *mut HashTableEntry {
        if self.directory.is_empty() {
            return std::ptr::null_mut();
        }
        let slot = self.directory[(hash & self.mask) as usize].load(Ordering::Relaxed);
        if slot & tag_bit(hash) == 0 {
            return std::ptr::null_mut();
        }
        (slot & POINTER_MASK) as *mut HashTableEntry
    }

    /// Issues a non-blocking prefetch of the directory slot for `hash`.
    #[inline]
    pub fn prefetch_chain_head(&self, hash: HashVal) {
        if self.directory.is_empty() {
            return;
        }
        let slot = &self.directory[(hash & self.mask) as usize];
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_prefetch(
                slot as *const AtomicU64 as *const i8,
                std::arch::x86_64::_MM_HINT_T0,
            );
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = slot;
        }
    }

    /// Calls `callback` for every entry of every chain, then empties the
    /// table. Callbacks may relink `entry.next` freely; the successor is
    /// read before the call.
    pub fn drain(&mut self, mut callback: impl FnMut(*mut HashTableEntry)) {
        for slot in &self.directory {
            let mut entry = (slot.load(Ordering::Relaxed) & POINTER_MASK) as *mut HashTableEntry;
            while !entry.is_null() {
                let next = unsafe { (*entry).next };
                callback(entry);
                entry = next;
            }
            slot.store(0, Ordering::Relaxed);
        }
        self.num_elems = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ChunkedVector;

    fn make_entries(hashes: &[HashVal]) -> (ChunkedVector, Vec<*mut HashTableEntry>) {
        let mut storage = ChunkedVector::new(HashTableEntry::HEADER_SIZE + 8);
        let ptrs = hashes
            .iter()
            .map(|&hash| {
                let entry = unsafe { HashTableEntry::from_raw(storage.append()) };
                entry.hash = hash;
                entry as *mut HashTableEntry
            })
            .collect();
        (storage, ptrs)
    }

    #[test]
    fn inserted_entries_are_reachable_from_chain_head() {
        let hashes: Vec<HashVal> = (0..512).map(|i| crate::exec::ops::hash_scalar(&i)).collect();
        let (_storage, entries) = make_entries(&hashes);

        let mut table = GenericHashTable::new(DEFAULT_LOAD_FACTOR);
        table.set_size(hashes.len() as u64);
        for &entry in &entries {
            table.insert(entry, unsafe { (*entry).hash });
        }
        assert_eq!(table.num_elements(), 512);

        for &entry in &entries {
            let hash = unsafe { (*entry).hash };
            let mut head = table.find_chain_head(hash);
            let mut found = false;
            while !head.is_null() {
                if head == entry {
                    found = true;
                    break;
                }
                head = unsafe { (*head).next };
            }
            assert!(found, "entry unreachable from its chain head");
        }
    }

    #[test]
    fn drain_visits_every_entry_and_empties() {
        let hashes: Vec<HashVal> = (0..100).map(|i| crate::exec::ops::hash_scalar(&i)).collect();
        let (_storage, entries) = make_entries(&hashes);
        let mut table = GenericHashTable::new(DEFAULT_LOAD_FACTOR);
        table.set_size(100);
        for &entry in &entries {
            table.insert(entry, unsafe { (*entry).hash });
        }

        let mut seen = 0usize;
        table.drain(|_| seen += 1);
        assert_eq!(seen, 100);
        assert_eq!(table.num_elements(), 0);
        assert!(table.find_chain_head(hashes[0]).is_null());
    }

    #[test]
    fn concurrent_insert_agrees_with_serial() {
        let hashes: Vec<HashVal> = (0..256).map(|i| crate::exec::ops::hash_scalar(&i)).collect();
        let (_storage, entries) = make_entries(&hashes);
        let mut table = GenericHashTable::new(DEFAULT_LOAD_FACTOR);
        table.set_size(256);
        for &entry in &entries {
            table.insert_concurrent(entry, unsafe { (*entry).hash });
        }
        table.set_num_elements(256);

        for &entry in &entries {
            let hash = unsafe { (*entry).hash };
            let mut head = table.find_chain_head(hash);
            let mut found = false;
            while !head.is_null() {
                found |= head == entry;
                head = unsafe { (*head).next };
            }
            assert!(found);
        }
    }
}
