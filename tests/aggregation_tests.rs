//! Aggregation hash table behavior: the scalar insert/lookup path, the
//! batched process path, and the equivalence between unpartitioned
//! aggregation and partitioned aggregation with transfer plus parallel scan.

use std::collections::HashMap;
use std::sync::Mutex;

use kestrel::exec::ops::hash_scalar;
use kestrel::exec::{AggregationHashTable, VectorProjection, VectorProjectionIterator};
use kestrel::pool::{ThreadStateContainer, WorkerPool};
use kestrel::types::TypeId;

/// Payload layout: [key: i64, count: i64].
const PAYLOAD_SIZE: usize = 16;

unsafe fn key_of(payload: *const u8) -> i64 {
    (payload as *const i64).read_unaligned()
}

unsafe fn count_of(payload: *const u8) -> i64 {
    (payload.add(8) as *const i64).read_unaligned()
}

unsafe fn write_group(payload: *mut u8, key: i64, count: i64) {
    (payload as *mut i64).write_unaligned(key);
    (payload.add(8) as *mut i64).write_unaligned(count);
}

fn make_batch(keys: &[i64]) -> VectorProjection {
    let mut vp = VectorProjection::new_owning(&[TypeId::BigInt]);
    vp.reset(keys.len());
    vp.column_mut(0).values_mut::<i64>()[..keys.len()].copy_from_slice(keys);
    vp
}

fn process_keys_into(table: &mut AggregationHashTable, keys: &[i64], partitioned: bool) {
    let vp = make_batch(keys);
    let mut vpi = VectorProjectionIterator::new(&vp);
    table.process_batch(
        &mut vpi,
        &|v: &VectorProjectionIterator<'_>| hash_scalar(&v.get::<i64>(0)),
        &|payload, v| unsafe { key_of(payload) } == v.get::<i64>(0),
        &mut |payload, v| unsafe { write_group(payload, v.get::<i64>(0), 1) },
        &mut |payload, _v| unsafe {
            let count = count_of(payload);
            (payload.add(8) as *mut i64).write_unaligned(count + 1);
        },
        partitioned,
    );
}

#[test]
fn scalar_insert_and_lookup() {
    let mut table = AggregationHashTable::new(PAYLOAD_SIZE);
    for round in 0..2 {
        for key in 0..100i64 {
            let hash = hash_scalar(&key);
            match table.lookup(hash, |payload| unsafe { key_of(payload) } == key) {
                Some(payload) => unsafe {
                    let count = count_of(payload);
                    (payload.add(8) as *mut i64).write_unaligned(count + 1);
                },
                None => {
                    assert_eq!(round, 0, "group must exist in the second round");
                    let payload = table.insert(hash);
                    unsafe { write_group(payload, key, 1) };
                }
            }
        }
    }
    assert_eq!(table.num_groups(), 100);
    table.for_each_group(|payload| {
        assert_eq!(unsafe { count_of(payload) }, 2);
    });
}

#[test]
fn batch_aggregation_counts_groups() {
    // Ten passes over keys 0..999: one thousand groups of count ten.
    let mut table = AggregationHashTable::new(PAYLOAD_SIZE);
    let keys: Vec<i64> = (0..1000).collect();
    for _ in 0..10 {
        process_keys_into(&mut table, &keys, false);
    }

    assert_eq!(table.num_groups(), 1000);
    let mut counts = HashMap::new();
    table.for_each_group(|payload| {
        let key = unsafe { key_of(payload) };
        let count = unsafe { count_of(payload) };
        assert!(counts.insert(key, count).is_none(), "duplicate group {key}");
    });
    assert!(counts.values().all(|&c| c == 10));
    assert!(table.stats().num_growths > 0);
}

#[test]
fn batch_aggregation_handles_duplicates_inside_one_batch() {
    let mut table = AggregationHashTable::new(PAYLOAD_SIZE);
    let keys: Vec<i64> = (0..500).map(|i| i % 50).collect();
    process_keys_into(&mut table, &keys, false);

    assert_eq!(table.num_groups(), 50);
    table.for_each_group(|payload| {
        assert_eq!(unsafe { count_of(payload) }, 10);
    });
}

#[test]
fn partitioned_aggregation_matches_unpartitioned() {
    const NUM_THREADS: usize = 4;
    const NUM_KEYS: i64 = 1000;
    const PASSES: usize = 10;

    // Reference: unpartitioned.
    let mut reference = AggregationHashTable::new(PAYLOAD_SIZE);
    let keys: Vec<i64> = (0..NUM_KEYS).collect();
    for _ in 0..PASSES {
        process_keys_into(&mut reference, &keys, false);
    }
    let mut expected = HashMap::new();
    reference.for_each_group(|payload| {
        expected.insert(unsafe { key_of(payload) }, unsafe { count_of(payload) });
    });

    // Partitioned: per-thread pre-aggregation, then transfer and scan.
    let mut container = ThreadStateContainer::new();
    container.reset(
        NUM_THREADS,
        std::mem::size_of::<AggregationHashTable>(),
        Some(Box::new(|ptr| unsafe {
            (ptr as *mut AggregationHashTable).write(AggregationHashTable::new(PAYLOAD_SIZE));
        })),
        Some(Box::new(|ptr| unsafe {
            std::ptr::drop_in_place(ptr as *mut AggregationHashTable);
        })),
    );

    for pass in 0..PASSES {
        let table: &mut AggregationHashTable =
            unsafe { container.state_at(pass % NUM_THREADS, 0) };
        process_keys_into(table, &keys, true);
    }

    let mut merged = AggregationHashTable::new(PAYLOAD_SIZE);
    merged.transfer_partitions(&container, 0);

    let pool = WorkerPool::with_threads(NUM_THREADS);
    let observed = Mutex::new(HashMap::new());
    merged.parallel_partitioned_scan(
        &pool,
        &|left, right| unsafe { key_of(left) == key_of(right) },
        &|dst, src| unsafe {
            let total = count_of(dst) + count_of(src);
            (dst.add(8) as *mut i64).write_unaligned(total);
        },
        &|payload| {
            let key = unsafe { key_of(payload) };
            let count = unsafe { count_of(payload) };
            let previous = observed.lock().unwrap().insert(key, count);
            assert!(previous.is_none(), "group {key} scanned twice");
        },
    );

    let observed = observed.into_inner().unwrap();
    assert_eq!(observed, expected);
    assert_eq!(observed.len(), NUM_KEYS as usize);
    assert!(observed.values().all(|&c| c == PASSES as i64));
}
