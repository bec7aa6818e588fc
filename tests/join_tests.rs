//! Join hash table behavior: lazy build, tuple-at-a-time lookup, the
//! vectorized probe, the concise variant, and the parallel merged build.

use kestrel::exec::join::JoinHashTableVectorProbe;
use kestrel::exec::ops::hash_scalar;
use kestrel::exec::{JoinHashTable, VectorProjection, VectorProjectionIterator};
use kestrel::pool::{ThreadStateContainer, WorkerPool};
use kestrel::types::TypeId;

/// Build-side payload layout: [key: i64, value: i64].
const TUPLE_SIZE: usize = 16;

unsafe fn key_of(payload: *const u8) -> i64 {
    (payload as *const i64).read_unaligned()
}

unsafe fn value_of(payload: *const u8) -> i64 {
    (payload.add(8) as *const i64).read_unaligned()
}

fn build_side(table: &mut JoinHashTable, keys: impl Iterator<Item = i64>) {
    for key in keys {
        let payload = table.alloc_input_tuple(hash_scalar(&key));
        unsafe {
            (payload as *mut i64).write_unaligned(key);
            (payload.add(8) as *mut i64).write_unaligned(key * 1000);
        }
    }
}

fn probe_batch(table: &JoinHashTable, probe_keys: &[i64]) -> Vec<(usize, i64)> {
    let mut vp = VectorProjection::new_owning(&[TypeId::BigInt]);
    vp.reset(probe_keys.len());
    vp.column_mut(0).values_mut::<i64>()[..probe_keys.len()].copy_from_slice(probe_keys);

    let mut vpi = VectorProjectionIterator::new(&vp);
    let mut probe = JoinHashTableVectorProbe::new(table);
    probe.prepare(&mut vpi, &|v: &VectorProjectionIterator<'_>| {
        hash_scalar(&v.get::<i64>(0))
    });

    let mut matches = Vec::new();
    while let Some((position, payload)) =
        probe.next_match(&mut vpi, &|payload, v| unsafe { key_of(payload) }
            == v.get::<i64>(0))
    {
        matches.push((position, unsafe { value_of(payload) }));
    }
    matches
}

#[test]
fn vectorized_probe_finds_every_match() {
    let mut table = JoinHashTable::new(TUPLE_SIZE, false);
    build_side(&mut table, 0..1000);
    assert!(!table.is_built());
    table.build();
    assert!(table.is_built());
    assert_eq!(table.num_elements(), 1000);

    // Probe 10,000 rows drawn uniformly from the key domain, in batches.
    let mut total_matches = 0usize;
    for batch_idx in 0..5 {
        let probe_keys: Vec<i64> = (0..2000).map(|i| (batch_idx * 2000 + i) % 1000).collect();
        let matches = probe_batch(&table, &probe_keys);
        assert_eq!(matches.len(), probe_keys.len());
        for (position, build_value) in matches {
            // The returned build row carries the probe row's key.
            assert_eq!(build_value, probe_keys[position] * 1000);
        }
        total_matches += probe_keys.len();
    }
    assert_eq!(total_matches, 10_000);
}

#[test]
fn probe_misses_produce_no_output() {
    let mut table = JoinHashTable::new(TUPLE_SIZE, false);
    build_side(&mut table, 0..100);
    table.build();

    let probe_keys: Vec<i64> = (1000..1100).collect();
    assert!(probe_batch(&table, &probe_keys).is_empty());
}

#[test]
fn duplicate_build_keys_emit_one_match_each() {
    let mut table = JoinHashTable::new(TUPLE_SIZE, false);
    build_side(&mut table, (0..50).chain(0..50));
    table.build();

    let probe_keys: Vec<i64> = (0..50).collect();
    let matches = probe_batch(&table, &probe_keys);
    // Every probe key hits both duplicates.
    assert_eq!(matches.len(), 100);
    for (position, build_value) in matches {
        assert_eq!(build_value, probe_keys[position] * 1000);
    }
}

#[test]
fn concise_table_agrees_with_generic() {
    let mut generic = JoinHashTable::new(TUPLE_SIZE, false);
    let mut concise = JoinHashTable::new(TUPLE_SIZE, true);
    build_side(&mut generic, 0..777);
    build_side(&mut concise, 0..777);
    generic.build();
    concise.build();
    assert!(concise.uses_concise_table());

    let probe_keys: Vec<i64> = (-100..900).collect();
    let mut from_generic = probe_batch(&generic, &probe_keys);
    let mut from_concise = probe_batch(&concise, &probe_keys);
    from_generic.sort_unstable();
    from_concise.sort_unstable();
    assert_eq!(from_generic, from_concise);
}

#[test]
fn tuple_at_a_time_lookup_agrees_with_probe() {
    let mut table = JoinHashTable::new(TUPLE_SIZE, false);
    build_side(&mut table, 0..200);
    table.build();

    for key in 0..200i64 {
        let mut iter = table.lookup(hash_scalar(&key));
        let payload = iter
            .next_match(|payload| unsafe { key_of(payload) } == key)
            .expect("key must be present");
        assert_eq!(unsafe { value_of(payload) }, key * 1000);
        assert!(iter
            .next_match(|payload| unsafe { key_of(payload) } == key)
            .is_none());
    }
}

#[test]
fn parallel_build_merges_thread_local_tables() {
    const NUM_THREADS: usize = 4;

    let mut container = ThreadStateContainer::new();
    container.reset(
        NUM_THREADS,
        std::mem::size_of::<JoinHashTable>(),
        Some(Box::new(|ptr| unsafe {
            (ptr as *mut JoinHashTable).write(JoinHashTable::new(TUPLE_SIZE, false));
        })),
        Some(Box::new(|ptr| unsafe {
            std::ptr::drop_in_place(ptr as *mut JoinHashTable);
        })),
    );

    // Each thread-local table holds a disjoint slice of the key domain.
    for thread_idx in 0..NUM_THREADS {
        let table: &mut JoinHashTable = unsafe { container.state_at(thread_idx, 0) };
        let base = thread_idx as i64 * 250;
        build_side(table, base..base + 250);
    }

    let mut global = JoinHashTable::new(TUPLE_SIZE, false);
    let pool = WorkerPool::with_threads(NUM_THREADS);
    global.merge_parallel(&container, 0, &pool);
    assert!(global.is_built());
    assert_eq!(global.num_elements(), 1000);

    let probe_keys: Vec<i64> = (0..1000).collect();
    let matches = probe_batch(&global, &probe_keys);
    assert_eq!(matches.len(), 1000);
    for (position, build_value) in matches {
        assert_eq!(build_value, probe_keys[position] * 1000);
    }
}
