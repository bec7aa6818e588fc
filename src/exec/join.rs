//! Build-once hash table for join processing.
//!
//! Inserts are lazy: [`JoinHashTable::alloc_input_tuple`] only allocates
//! storage and links the entry onto a private list. [`JoinHashTable::build`]
//! materializes either a generic chained table or the concise variant, which
//! reorders entries into a dense slot-sorted array with an optional bloom
//! filter in front. After build the table is immutable.

use tracing::debug;

use crate::exec::hash_table::{GenericHashTable, HashTableEntry, DEFAULT_LOAD_FACTOR};
use crate::exec::projection::VectorProjectionIterator;
use crate::pool::{ThreadStateContainer, WorkerPool};
use crate::types::HashVal;
use crate::util::{next_power_of_two, ChunkedVector};

const PREFETCH_DISTANCE: usize = 16;
const PREFETCH_THRESHOLD_BYTES: usize = 32 << 20;

/// Blocked bloom filter fronting the concise table.
struct BloomFilter {
    words: Vec<u64>,
    mask: u64,
}

impl BloomFilter {
    /// Ten bits per key, rounded to a power-of-two word count.
    fn with_capacity(num_keys: u64) -> Self {
        let num_words = next_power_of_two((num_keys * 10).div_ceil(64)).max(8);
        BloomFilter {
            words: vec![0; num_words as usize],
            mask: num_words - 1,
        }
    }

    #[inline]
    fn probes(hash: HashVal, mask: u64) -> (usize, u64) {
        let word = (hash >> 32) & mask;
        let bits = (1u64 << (hash & 63)) | (1u64 << ((hash >> 6) & 63));
        (word as usize, bits)
    }

    fn add(&mut self, hash: HashVal) {
        let (word, bits) = Self::probes(hash, self.mask);
        self.words[word] |= bits;
    }

    fn maybe_contains(&self, hash: HashVal) -> bool {
        let (word, bits) = Self::probes(hash, self.mask);
        self.words[word] & bits == bits
    }
}

/// Dense slot-ordered layout: entries for one slot occupy one contiguous
/// range, so a probe is either a definite miss or a short linear scan.
struct ConciseTable {
    mask: u64,
    /// `offsets[s]..offsets[s + 1]` bounds slot `s` in `ordered`.
    offsets: Vec<u32>,
    ordered: Vec<*mut HashTableEntry>,
}

impl ConciseTable {
    fn build(entries: impl Iterator<Item = *mut HashTableEntry>, num_elems: u64) -> Self {
        let num_slots = next_power_of_two((num_elems as f64 / DEFAULT_LOAD_FACTOR).ceil() as u64)
            .max(64);
        let mask = num_slots - 1;

        let mut counts = vec![0u32; num_slots as usize + 1];
        let collected: Vec<*mut HashTableEntry> = entries.collect();
        for &entry in &collected {
            let slot = (unsafe { (*entry).hash } & mask) as usize;
            counts[slot + 1] += 1;
        }
        for slot in 0..num_slots as usize {
            counts[slot + 1] += counts[slot];
        }

        let mut ordered = vec![std::ptr::null_mut(); collected.len()];
        let mut cursors = counts.clone();
        for &entry in &collected {
            let slot = (unsafe { (*entry).hash } & mask) as usize;
            ordered[cursors[slot] as usize] = entry;
            cursors[slot] += 1;
        }

        ConciseTable {
            mask,
            offsets: counts,
            ordered,
        }
    }

    /// The contiguous candidate range for `hash`.
    fn probe(&self, hash: HashVal) -> (u32, u32) {
        let slot = (hash & self.mask) as usize;
        (self.offsets[slot], self.offsets[slot + 1])
    }
}

/// The join hash table. `is_built` is monotonic; no insertions after build.
pub struct JoinHashTable {
    tuple_size: usize,
    entries: ChunkedVector,
    owned_entries: Vec<ChunkedVector>,
    generic_table: GenericHashTable,
    concise_table: Option<ConciseTable>,
    bloom_filter: Option<BloomFilter>,
    /// Head of the lazy insertion list.
    head: *mut HashTableEntry,
    num_elems: u64,
    built: bool,
    use_concise: bool,
}

unsafe impl Send for JoinHashTable {}

impl JoinHashTable {
    pub fn new(tuple_size: usize, use_concise: bool) -> Self {
        JoinHashTable {
            tuple_size,
            entries: ChunkedVector::new(HashTableEntry::HEADER_SIZE + tuple_size),
            owned_entries: Vec::new(),
            generic_table: GenericHashTable::new(DEFAULT_LOAD_FACTOR),
            concise_table: None,
            bloom_filter: None,
            head: std::ptr::null_mut(),
            num_elems: 0,
            built: false,
            use_concise,
        }
    }

    #[inline]
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    #[inline]
    pub fn num_elements(&self) -> u64 {
        self.num_elems
    }

    #[inline]
    pub fn is_built(&self) -> bool {
        self.built
    }

    #[inline]
    pub fn uses_concise_table(&self) -> bool {
        self.use_concise
    }

    /// Allocates storage for one build-side tuple with the given hash and
    /// returns the payload area to materialize into. No table structure is
    /// touched until [`JoinHashTable::build`].
    pub fn alloc_input_tuple(&mut self, hash: HashVal) -> *mut u8 {
        assert!(!self.built, "insertions after build are not allowed");
        let entry = unsafe { HashTableEntry::from_raw(self.entries.append()) };
        entry.hash = hash;
        entry.next = self.head;
        self.head = entry;
        self.num_elems += 1;
        entry.payload()
    }

    /// Materializes the lookup structure. Idempotent.
    pub fn build(&mut self) {
        if self.built {
            return;
        }
        if self.use_concise {
            self.build_concise();
        } else {
            self.build_generic();
        }
        self.built = true;
    }

    fn build_generic(&mut self) {
        self.generic_table.set_size(self.num_elems);
        let mut entry = self.head;
        while !entry.is_null() {
            // Insert relinks `next`, so step first.
            let next = unsafe { (*entry).next };
            let hash = unsafe { (*entry).hash };
            self.generic_table.insert(entry, hash);
            entry = next;
        }
        self.head = std::ptr::null_mut();
        debug!(elems = self.num_elems, "built generic join table");
    }

    fn build_concise(&mut self) {
        let mut bloom = BloomFilter::with_capacity(self.num_elems.max(1));
        let mut list = Vec::with_capacity(self.num_elems as usize);
        let mut entry = self.head;
        while !entry.is_null() {
            let next = unsafe { (*entry).next };
            bloom.add(unsafe { (*entry).hash });
            list.push(entry);
            entry = next;
        }
        self.head = std::ptr::null_mut();
        self.concise_table = Some(ConciseTable::build(list.into_iter(), self.num_elems));
        self.bloom_filter = Some(bloom);
        debug!(elems = self.num_elems, "built concise join table");
    }

    /// Merges every thread-local join table in `container` (each slot holds
    /// a `JoinHashTable` at `jht_offset`) into this one with a single
    /// directory and concurrent atomic inserts. Sub-tables surrender their
    /// entry storage. The merged table always uses the generic layout.
    pub fn merge_parallel(
        &mut self,
        container: &ThreadStateContainer<'_>,
        jht_offset: usize,
        pool: &WorkerPool,
    ) {
        assert!(!self.built);

        let mut sources = Vec::new();
        for thread_idx in 0..container.num_threads() {
            let table: &mut JoinHashTable = unsafe { container.state_at(thread_idx, jht_offset) };
            if table.num_elems > 0 {
                sources.push(table);
            }
        }

        let total: u64 = sources.iter().map(|t| t.num_elems).sum::<u64>() + self.num_elems;
        self.generic_table.set_size(total);

        // Insert this table's own pending list first.
        let mut entry = self.head;
        while !entry.is_null() {
            let next = unsafe { (*entry).next };
            let hash = unsafe { (*entry).hash };
            self.generic_table.insert_concurrent(entry, hash);
            entry = next;
        }
        self.head = std::ptr::null_mut();

        {
            let table = &self.generic_table;
            struct ListHead(*mut HashTableEntry);
            unsafe impl Send for ListHead {}

            let tasks: Vec<Box<dyn FnOnce() + Send + '_>> = sources
                .iter()
                .map(|source| {
                    let head = ListHead(source.head);
                    let task: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                        let head = head;
                        let mut entry = head.0;
                        while !entry.is_null() {
                            let next = unsafe { (*entry).next };
                            let hash = unsafe { (*entry).hash };
                            table.insert_concurrent(entry, hash);
                            entry = next;
                        }
                    });
                    task
                })
                .collect();
            pool.run_tasks(tasks);
        }

        for source in sources {
            source.head = std::ptr::null_mut();
            let mut adopted = ChunkedVector::new(self.entries.element_size());
            std::mem::swap(&mut adopted, &mut source.entries);
            self.owned_entries.push(adopted);
            self.owned_entries.append(&mut source.owned_entries);
            source.num_elems = 0;
            source.built = true;
        }

        self.num_elems = total;
        self.generic_table.set_num_elements(total);
        self.built = true;
        debug!(elems = total, "parallel join build complete");
    }

    /// Tuple-at-a-time lookup: an iterator over the candidate entries whose
    /// hash equals `hash`, in chain (or slot-range) order.
    pub fn lookup(&self, hash: HashVal) -> JoinHashTableIterator<'_> {
        debug_assert!(self.built, "lookup before build");
        let cursor = match &self.concise_table {
            Some(concise) => {
                let pass = self
                    .bloom_filter
                    .as_ref()
                    .map_or(true, |bloom| bloom.maybe_contains(hash));
                let (start, end) = if pass { concise.probe(hash) } else { (0, 0) };
                Cursor::Range(start, end)
            }
            None => Cursor::Chain(self.generic_table.find_chain_head(hash)),
        };
        JoinHashTableIterator {
            table: self,
            hash,
            cursor,
        }
    }

    #[inline]
    fn advance_cursor(&self, cursor: &mut Cursor, hash: HashVal) -> Option<*mut HashTableEntry> {
        loop {
            match *cursor {
                Cursor::Chain(entry) => {
                    if entry.is_null() {
                        return None;
                    }
                    *cursor = Cursor::Chain(unsafe { (*entry).next });
                    if unsafe { (*entry).hash } == hash {
                        return Some(entry);
                    }
                }
                Cursor::Range(start, end) => {
                    if start == end {
                        return None;
                    }
                    let concise = self.concise_table.as_ref().unwrap();
                    let current = concise.ordered[start as usize];
                    *cursor = Cursor::Range(start + 1, end);
                    if unsafe { (*current).hash } == hash {
                        return Some(current);
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Cursor {
    Chain(*mut HashTableEntry),
    Range(u32, u32),
}

/// Iterator over hash-matching candidate entries for a single probe tuple.
pub struct JoinHashTableIterator<'a> {
    table: &'a JoinHashTable,
    hash: HashVal,
    cursor: Cursor,
}

impl JoinHashTableIterator<'_> {
    /// The next candidate whose hash matches and whose payload satisfies
    /// `key_eq`, or `None` when the candidates are exhausted.
    pub fn next_match(&mut self, key_eq: impl Fn(*const u8) -> bool) -> Option<*const u8> {
        while let Some(entry) = self.table.advance_cursor(&mut self.cursor, self.hash) {
            let payload = unsafe { (*entry).payload() };
            if key_eq(payload) {
                return Some(payload);
            }
        }
        None
    }
}

/// Working state for a vectorized probe: per probe position, the hashes and
/// the not-yet-exhausted candidate cursor.
pub struct JoinHashTableVectorProbe<'a> {
    table: &'a JoinHashTable,
    hashes: Vec<HashVal>,
    cursors: Vec<Cursor>,
    position: usize,
}

impl<'a> JoinHashTableVectorProbe<'a> {
    pub fn new(table: &'a JoinHashTable) -> Self {
        debug_assert!(table.is_built(), "probe before build");
        JoinHashTableVectorProbe {
            table,
            hashes: Vec::new(),
            cursors: Vec::new(),
            position: 0,
        }
    }

    /// Hashes the input batch and installs the initial candidate cursors,
    /// prefetching directory slots when the table is larger than cache.
    pub fn prepare(
        &mut self,
        vpi: &mut VectorProjectionIterator<'_>,
        hash_fn: &dyn Fn(&VectorProjectionIterator<'_>) -> HashVal,
    ) {
        let num_elems = vpi.num_selected();
        self.hashes.clear();
        self.cursors.clear();
        self.position = 0;

        vpi.reset();
        while vpi.has_next() {
            self.hashes.push(hash_fn(vpi));
            vpi.advance();
        }
        vpi.reset();

        let prefetch = self.table.generic_table.total_memory_usage() > PREFETCH_THRESHOLD_BYTES;
        for idx in 0..num_elems {
            if prefetch {
                if let Some(&ahead) = self.hashes.get(idx + PREFETCH_DISTANCE) {
                    self.table.generic_table.prefetch_chain_head(ahead);
                }
            }
            let cursor = match &self.table.concise_table {
                Some(concise) => {
                    let hash = self.hashes[idx];
                    let pass = self
                        .table
                        .bloom_filter
                        .as_ref()
                        .map_or(true, |bloom| bloom.maybe_contains(hash));
                    let (start, end) = if pass { concise.probe(hash) } else { (0, 0) };
                    Cursor::Range(start, end)
                }
                None => Cursor::Chain(self.table.generic_table.find_chain_head(self.hashes[idx])),
            };
            self.cursors.push(cursor);
        }
    }

    /// Produces the next `(probe position, build payload)` match. Matches
    /// come grouped by probe position, and within one position in
    /// hash-chain order. `key_eq` sees the build payload and the iterator
    /// positioned on the probe row.
    pub fn next_match(
        &mut self,
        vpi: &mut VectorProjectionIterator<'_>,
        key_eq: &dyn Fn(*const u8, &VectorProjectionIterator<'_>) -> bool,
    ) -> Option<(usize, *const u8)> {
        while self.position < self.cursors.len() {
            let pos = self.position;
            let hash = self.hashes[pos];
            vpi.set_position(pos);
            let mut cursor = self.cursors[pos];
            while let Some(entry) = self.table.advance_cursor(&mut cursor, hash) {
                let payload = unsafe { (*entry).payload() };
                if key_eq(payload, vpi) {
                    self.cursors[pos] = cursor;
                    return Some((pos, payload));
                }
            }
            self.cursors[pos] = cursor;
            self.position += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ops::hash_scalar;

    fn build_table(keys: &[i64], use_concise: bool) -> JoinHashTable {
        let mut table = JoinHashTable::new(8, use_concise);
        for &key in keys {
            let payload = table.alloc_input_tuple(hash_scalar(&key));
            unsafe { (payload as *mut i64).write_unaligned(key) };
        }
        table.build();
        table
    }

    fn probe_one(table: &JoinHashTable, key: i64) -> Vec<i64> {
        let mut matches = Vec::new();
        let mut iter = table.lookup(hash_scalar(&key));
        while let Some(payload) =
            iter.next_match(|p| unsafe { (p as *const i64).read_unaligned() } == key)
        {
            matches.push(unsafe { (payload as *const i64).read_unaligned() });
        }
        matches
    }

    #[test]
    fn generic_lookup_finds_all_duplicates() {
        let keys: Vec<i64> = (0..100).chain(0..100).collect();
        let table = build_table(&keys, false);
        assert!(table.is_built());
        for key in 0..100 {
            assert_eq!(probe_one(&table, key), vec![key, key]);
        }
        assert!(probe_one(&table, 1000).is_empty());
    }

    #[test]
    fn concise_lookup_matches_generic() {
        let keys: Vec<i64> = (0..500).collect();
        let generic = build_table(&keys, false);
        let concise = build_table(&keys, true);
        for key in -50..550 {
            assert_eq!(probe_one(&generic, key), probe_one(&concise, key));
        }
    }

    #[test]
    #[should_panic(expected = "insertions after build")]
    fn insert_after_build_panics() {
        let mut table = build_table(&[1, 2, 3], false);
        table.alloc_input_tuple(hash_scalar(&4i64));
    }
}
