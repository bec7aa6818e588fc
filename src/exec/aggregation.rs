//! Hash-based grouping with pre-aggregation, cache-aware radix-partitioned
//! spill, and a parallel partitioned merge-and-scan.
//!
//! Aggregate semantics are externalized: the table allocates opaque payload
//! storage and the client supplies hash, key-equality, initialize, advance
//! and merge callbacks. In partitioned mode a thread-local table that grows
//! past a cache-derived threshold drains its chains into 256 linked lists
//! keyed by the high hash bits; partitions are later merged independently.

use tracing::debug;

use crate::exec::hash_table::{GenericHashTable, HashTableEntry, DEFAULT_LOAD_FACTOR};
use crate::exec::projection::VectorProjectionIterator;
use crate::pool::{ThreadStateContainer, WorkerPool};
use crate::types::HashVal;
use crate::util::{prev_power_of_two, ChunkedVector};

/// Number of radix partitions used for spilling. Power of two.
pub const DEFAULT_NUM_PARTITIONS: usize = 256;

const DEFAULT_INITIAL_TABLE_SIZE: u64 = 256;

/// Cache-size model used to pick the flush threshold and the prefetch
/// cutover. Fixed constants; there is no runtime CPU introspection.
const L2_CACHE_BYTES: usize = 1 << 20;
const L3_CACHE_BYTES: usize = 32 << 20;

const PREFETCH_DISTANCE: usize = 16;

#[derive(Clone, Copy, Debug, Default)]
pub struct AggregationStats {
    pub num_growths: u64,
    pub num_flushes: u64,
}

/// The partition-aware aggregation hash table.
pub struct AggregationHashTable {
    payload_size: usize,
    entries: ChunkedVector,
    /// Entry storage adopted from thread-local tables during a transfer.
    owned_entries: Vec<ChunkedVector>,
    hash_table: GenericHashTable,
    max_fill: u64,
    flush_threshold: u64,
    partition_shift: u32,
    partition_heads: Option<Vec<*mut HashTableEntry>>,
    partition_tails: Option<Vec<*mut HashTableEntry>>,
    stats: AggregationStats,
}

// Entries are owned by the chunked vectors inside; the raw pointers never
// escape the table's own lifetime.
unsafe impl Send for AggregationHashTable {}

impl AggregationHashTable {
    pub fn new(payload_size: usize) -> Self {
        let entry_size = HashTableEntry::HEADER_SIZE + payload_size;
        let mut hash_table = GenericHashTable::new(DEFAULT_LOAD_FACTOR);
        hash_table.set_size(DEFAULT_INITIAL_TABLE_SIZE);
        let max_fill = (hash_table.capacity() as f64 * hash_table.load_factor()).round() as u64;

        // Size the thread-local pre-aggregation working set to fit in L2.
        let flush_threshold = prev_power_of_two(
            (L2_CACHE_BYTES as f64 / entry_size as f64 * DEFAULT_LOAD_FACTOR) as u64,
        )
        .max(256);

        AggregationHashTable {
            payload_size,
            entries: ChunkedVector::new(entry_size),
            owned_entries: Vec::new(),
            hash_table,
            max_fill,
            flush_threshold,
            partition_shift: (DEFAULT_NUM_PARTITIONS as u64 - 1).leading_zeros(),
            partition_heads: None,
            partition_tails: None,
            stats: AggregationStats::default(),
        }
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Total number of groups created by this table (including any that were
    /// spilled to partitions).
    #[inline]
    pub fn num_groups(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> AggregationStats {
        self.stats
    }

    fn needs_to_grow(&self) -> bool {
        self.hash_table.num_elements() >= self.max_fill
    }

    fn grow(&mut self) {
        // set_size doubles the directory: capacity(expected) = 2 * expected
        // for power-of-two expected at the 0.5 load factor.
        self.hash_table.set_size(self.hash_table.capacity());
        self.max_fill =
            (self.hash_table.capacity() as f64 * self.hash_table.load_factor()).round() as u64;

        // Relink every live entry into the doubled directory.
        for raw in self.entries.iter() {
            let entry = unsafe { HashTableEntry::from_raw(raw) };
            let hash = entry.hash;
            self.hash_table.insert(entry, hash);
        }
        self.stats.num_growths += 1;
    }

    /// Allocates a fresh group for `hash` and returns its payload storage.
    pub fn insert(&mut self, hash: HashVal) -> *mut u8 {
        if self.needs_to_grow() {
            self.grow();
        }
        let entry = unsafe { HashTableEntry::from_raw(self.entries.append()) };
        entry.hash = hash;
        entry.next = std::ptr::null_mut();
        let payload = entry.payload();
        self.hash_table.insert(entry, hash);
        payload
    }

    /// Like [`AggregationHashTable::insert`], but spills the table into the
    /// radix partitions once it outgrows the flush threshold.
    pub fn insert_partitioned(&mut self, hash: HashVal) -> *mut u8 {
        let payload = self.insert(hash);
        if self.hash_table.num_elements() >= self.flush_threshold {
            self.flush_to_partitions();
        }
        payload
    }

    /// Walks the chain for `hash`, delegating key equality to `key_eq` over
    /// candidate payloads. Returns the payload of the matching group, if any.
    pub fn lookup(&self, hash: HashVal, key_eq: impl Fn(*const u8) -> bool) -> Option<*mut u8> {
        let mut entry = self.hash_table.find_chain_head(hash);
        while !entry.is_null() {
            let candidate = unsafe { &*entry };
            if candidate.hash == hash && key_eq(candidate.payload()) {
                return Some(candidate.payload());
            }
            entry = candidate.next;
        }
        None
    }

    /// Drains every chain into the radix partition lists. Entries stay in
    /// this table's chunked storage; only their links move.
    pub fn flush_to_partitions(&mut self) {
        if self.partition_heads.is_none() {
            self.partition_heads = Some(vec![std::ptr::null_mut(); DEFAULT_NUM_PARTITIONS]);
            self.partition_tails = Some(vec![std::ptr::null_mut(); DEFAULT_NUM_PARTITIONS]);
        }
        let heads = self.partition_heads.as_mut().unwrap();
        let tails = self.partition_tails.as_mut().unwrap();
        let shift = self.partition_shift;

        self.hash_table.drain(|entry| {
            let part = (unsafe { (*entry).hash } >> shift) as usize;
            unsafe { (*entry).next = heads[part] };
            heads[part] = entry;
            if tails[part].is_null() {
                tails[part] = entry;
            }
        });
        self.stats.num_flushes += 1;
    }

    /// Batch insert/update. For every live row of `vpi`: find its group
    /// (creating it if missing) and fold the row in.
    ///
    /// `init_agg` runs for the first row of a new group and must fold that
    /// row into the fresh payload; `advance_agg` runs for every subsequent
    /// row of an existing group.
    pub fn process_batch(
        &mut self,
        vpi: &mut VectorProjectionIterator<'_>,
        hash_fn: &dyn Fn(&VectorProjectionIterator<'_>) -> HashVal,
        key_eq: &dyn Fn(*const u8, &VectorProjectionIterator<'_>) -> bool,
        init_agg: &mut dyn FnMut(*mut u8, &VectorProjectionIterator<'_>),
        advance_agg: &mut dyn FnMut(*mut u8, &VectorProjectionIterator<'_>),
        partitioned: bool,
    ) {
        let num_elems = vpi.num_selected();
        if num_elems == 0 {
            return;
        }

        // Phase one: hash every live row, then load the candidate chain
        // heads, prefetching when the directory has outgrown L3.
        let mut hashes = Vec::with_capacity(num_elems);
        vpi.reset();
        while vpi.has_next() {
            hashes.push(hash_fn(vpi));
            vpi.advance();
        }
        vpi.reset();

        let mut entries = vec![std::ptr::null_mut::<HashTableEntry>(); num_elems];
        let prefetch = self.hash_table.total_memory_usage() > L3_CACHE_BYTES;
        for idx in 0..num_elems {
            if prefetch {
                if let Some(&ahead) = hashes.get(idx + PREFETCH_DISTANCE) {
                    self.hash_table.prefetch_chain_head(ahead);
                }
            }
            entries[idx] = self.hash_table.find_chain_head(hashes[idx]);
        }

        // Phase two: resolve hash collisions by walking chains until every
        // candidate either matched on keys or ran off its chain.
        let mut group_sel: Vec<usize> = (0..num_elems).filter(|&i| !entries[i].is_null()).collect();
        self.follow_next_loop(vpi, &mut group_sel, &hashes, &mut entries, key_eq);

        // Phase three: rows with no entry get fresh groups.
        self.create_missing_groups(vpi, &hashes, &mut entries, key_eq, init_agg, partitioned);

        // Phase four: fold matched rows into their groups.
        for idx in 0..num_elems {
            if entries[idx].is_null() {
                continue;
            }
            vpi.set_position(idx);
            advance_agg(unsafe { (*entries[idx]).payload() }, vpi);
        }
        vpi.reset();
    }

    fn follow_next_loop(
        &self,
        vpi: &mut VectorProjectionIterator<'_>,
        group_sel: &mut Vec<usize>,
        hashes: &[HashVal],
        entries: &mut [*mut HashTableEntry],
        key_eq: &dyn Fn(*const u8, &VectorProjectionIterator<'_>) -> bool,
    ) {
        while !group_sel.is_empty() {
            let mut write_idx = 0;
            for read_idx in 0..group_sel.len() {
                let pos = group_sel[read_idx];
                let entry = unsafe { &*entries[pos] };
                vpi.set_position(pos);
                let keys_match = entry.hash == hashes[pos] && key_eq(entry.payload(), vpi);
                let has_next = !entry.next.is_null();
                group_sel[write_idx] = pos;
                write_idx += usize::from(!keys_match && has_next);
                if !keys_match && !has_next {
                    // Chain exhausted without a match: the row needs a new group.
                    entries[pos] = std::ptr::null_mut();
                }
            }
            // Mismatched candidates advance one link and go around again.
            for &pos in &group_sel[..write_idx] {
                entries[pos] = unsafe { (*entries[pos]).next };
            }
            group_sel.truncate(write_idx);
        }
        vpi.reset();
    }

    fn create_missing_groups(
        &mut self,
        vpi: &mut VectorProjectionIterator<'_>,
        hashes: &[HashVal],
        entries: &mut [*mut HashTableEntry],
        key_eq: &dyn Fn(*const u8, &VectorProjectionIterator<'_>) -> bool,
        init_agg: &mut dyn FnMut(*mut u8, &VectorProjectionIterator<'_>),
        partitioned: bool,
    ) {
        for pos in 0..entries.len() {
            if !entries[pos].is_null() {
                continue;
            }
            let hash = hashes[pos];
            vpi.set_position(pos);

            // An earlier row in this batch may have created the group.
            if let Some(payload) = self.lookup(hash, |candidate| key_eq(candidate, vpi)) {
                entries[pos] =
                    unsafe { payload.sub(HashTableEntry::HEADER_SIZE) as *mut HashTableEntry };
                continue;
            }

            let payload = if partitioned {
                self.insert_partitioned(hash)
            } else {
                self.insert(hash)
            };
            init_agg(payload, vpi);
        }
        vpi.reset();
    }

    /// Visits the payload of every group created by this table. Only
    /// meaningful in unpartitioned mode, where groups are never relinked.
    pub fn for_each_group(&self, mut f: impl FnMut(*const u8)) {
        for raw in self.entries.iter() {
            let entry = unsafe { HashTableEntry::from_raw(raw) };
            f(entry.payload());
        }
    }

    /// Pulls the spilled partitions out of every thread-local table in
    /// `container` (each slot holds an `AggregationHashTable` at
    /// `agg_offset`) and concatenates them into this table's partition
    /// lists, adopting entry storage along the way.
    pub fn transfer_partitions(
        &mut self,
        container: &ThreadStateContainer<'_>,
        agg_offset: usize,
    ) {
        if self.partition_heads.is_none() {
            self.partition_heads = Some(vec![std::ptr::null_mut(); DEFAULT_NUM_PARTITIONS]);
            self.partition_tails = Some(vec![std::ptr::null_mut(); DEFAULT_NUM_PARTITIONS]);
        }

        for thread_idx in 0..container.num_threads() {
            let tl_table: &mut AggregationHashTable =
                unsafe { container.state_at(thread_idx, agg_offset) };
            if tl_table.hash_table.num_elements() > 0 {
                tl_table.flush_to_partitions();
            }

            if let (Some(tl_heads), Some(mut tl_tails)) =
                (tl_table.partition_heads.take(), tl_table.partition_tails.take())
            {
                let heads = self.partition_heads.as_mut().unwrap();
                let tails = self.partition_tails.as_mut().unwrap();
                for part in 0..DEFAULT_NUM_PARTITIONS {
                    if tl_heads[part].is_null() {
                        continue;
                    }
                    unsafe { (*tl_tails[part]).next = heads[part] };
                    heads[part] = tl_heads[part];
                    if tails[part].is_null() {
                        tails[part] = tl_tails[part];
                    }
                }
            }

            // Entries must outlive the thread-local table.
            let mut adopted = ChunkedVector::new(self.entries.element_size());
            std::mem::swap(&mut adopted, &mut tl_table.entries);
            self.owned_entries.push(adopted);
            self.owned_entries.append(&mut tl_table.owned_entries);
        }
    }

    /// Merges and scans every partition in parallel. For each partition, a
    /// merged mini-table is built by folding duplicate groups together with
    /// `merge`, then `scan` runs once per final group payload.
    pub fn parallel_partitioned_scan(
        &mut self,
        pool: &WorkerPool,
        key_eq: &(dyn Fn(*const u8, *const u8) -> bool + Sync),
        merge: &(dyn Fn(*mut u8, *const u8) + Sync),
        scan: &(dyn Fn(*const u8) + Sync),
    ) {
        let Some(heads) = &self.partition_heads else {
            return;
        };

        // Partitions are disjoint linked lists, so workers touch disjoint
        // entries; the wrapper only exists to let the raw heads cross the
        // scope boundary.
        struct Heads<'a>(&'a [*mut HashTableEntry]);
        unsafe impl Sync for Heads<'_> {}
        let shared = Heads(heads);

        let num_nonempty = heads.iter().filter(|head| !head.is_null()).count();
        debug!(partitions = num_nonempty, "parallel partitioned scan");

        pool.run_indexed(DEFAULT_NUM_PARTITIONS, |part| {
            let shared = &shared;
            let head = shared.0[part];
            if head.is_null() {
                return;
            }

            let mut chain_len = 0u64;
            let mut cursor = head;
            while !cursor.is_null() {
                chain_len += 1;
                cursor = unsafe { (*cursor).next };
            }

            let mut table = GenericHashTable::new(DEFAULT_LOAD_FACTOR);
            table.set_size(chain_len);
            let mut groups: Vec<*mut HashTableEntry> = Vec::new();

            let mut entry = head;
            while !entry.is_null() {
                let next = unsafe { (*entry).next };
                let hash = unsafe { (*entry).hash };
                let payload = unsafe { (*entry).payload() };

                let mut candidate = table.find_chain_head(hash);
                let mut merged = false;
                while !candidate.is_null() {
                    let cand = unsafe { &*candidate };
                    if cand.hash == hash && key_eq(cand.payload(), payload) {
                        merge(cand.payload(), payload);
                        merged = true;
                        break;
                    }
                    candidate = cand.next;
                }
                if !merged {
                    table.insert(entry, hash);
                    groups.push(entry);
                }
                entry = next;
            }

            for group in groups {
                scan(unsafe { (*group).payload() });
            }
        });
    }
}
