//! Worker pool for the coarse-grained parallel regions: partitioned
//! aggregation scans, parallel hash-table builds, parallel sorts and merges.
//!
//! Parallel regions are synchronous join points. Callers enqueue a batch of
//! work items and block until every item has run; worker threads pull items
//! off a shared channel, so an uneven batch load-balances itself.

pub mod thread_state;

pub use thread_state::ThreadStateContainer;

use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-width pool of workers. The pool itself holds no threads between
/// regions; each region spins up scoped workers bounded by the configured
/// width, which keeps borrowed work items safe without `'static` bounds.
pub struct WorkerPool {
    num_threads: usize,
}

impl WorkerPool {
    /// A pool as wide as the machine.
    pub fn new() -> Self {
        Self::with_threads(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    }

    pub fn with_threads(num_threads: usize) -> Self {
        WorkerPool {
            num_threads: num_threads.max(1),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Runs every closure in `tasks` and returns when all have finished.
    /// Tasks may borrow from the caller's stack.
    pub fn run_tasks<'env>(&self, tasks: Vec<Box<dyn FnOnce() + Send + 'env>>) {
        if tasks.is_empty() {
            return;
        }
        if self.num_threads == 1 || tasks.len() == 1 {
            for task in tasks {
                task();
            }
            return;
        }

        let (sender, receiver) = crossbeam::channel::unbounded();
        let num_workers = self.num_threads.min(tasks.len());
        for task in tasks {
            sender.send(task).expect("task channel open");
        }
        drop(sender);

        crossbeam::thread::scope(|scope| {
            for _ in 0..num_workers {
                let receiver = receiver.clone();
                scope.spawn(move |_| {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                });
            }
        })
        .expect("worker panicked in parallel region");
    }

    /// Runs `work(i)` for every `i` in `0..num_items`, load-balanced over the
    /// pool via an atomic claim counter.
    pub fn run_indexed<F>(&self, num_items: usize, work: F)
    where
        F: Fn(usize) + Sync,
    {
        if num_items == 0 {
            return;
        }
        let num_workers = self.num_threads.min(num_items);
        if num_workers == 1 {
            for i in 0..num_items {
                work(i);
            }
            return;
        }

        let next = AtomicUsize::new(0);
        crossbeam::thread::scope(|scope| {
            for _ in 0..num_workers {
                scope.spawn(|_| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= num_items {
                        break;
                    }
                    work(i);
                });
            }
        })
        .expect("worker panicked in parallel region");
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn run_indexed_visits_every_item_once() {
        let pool = WorkerPool::with_threads(4);
        let hits = (0..257).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        pool.run_indexed(hits.len(), |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn run_tasks_joins_borrowed_work() {
        let pool = WorkerPool::with_threads(3);
        let mut outputs = vec![0u64; 8];
        let tasks: Vec<Box<dyn FnOnce() + Send + '_>> = outputs
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| {
                let task: Box<dyn FnOnce() + Send + '_> = Box::new(move || *slot = i as u64 * 10);
                task
            })
            .collect();
        pool.run_tasks(tasks);
        assert_eq!(outputs, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }
}
