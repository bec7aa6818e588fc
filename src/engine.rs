//! The engine value a host embeds, and the per-query execution context.
//!
//! There are no process-level globals: everything a query needs (string
//! interner, worker pool, thread-local state, scratch memory) hangs off an
//! [`Engine`] or an [`ExecutionContext`] created from it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::pool::{ThreadStateContainer, WorkerPool};
use crate::util::Region;

/// A uniqued interned string. Equality is pointer equality.
#[derive(Clone, Debug)]
pub struct Identifier(Arc<str>);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Identifier {}

impl std::hash::Hash for Identifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The embedding handle. Owns the interner and the worker pool shared by
/// every query the host runs through it.
pub struct Engine {
    interner: Mutex<HashSet<Arc<str>>>,
    pool: Arc<WorkerPool>,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            interner: Mutex::new(HashSet::new()),
            pool: Arc::new(WorkerPool::new()),
        }
    }

    pub fn with_threads(num_threads: usize) -> Self {
        Engine {
            interner: Mutex::new(HashSet::new()),
            pool: Arc::new(WorkerPool::with_threads(num_threads)),
        }
    }

    /// Interns `text`, returning the canonical identifier for it.
    pub fn intern(&self, text: &str) -> Identifier {
        let mut interner = self.interner.lock().expect("interner poisoned");
        if let Some(existing) = interner.get(text) {
            return Identifier(Arc::clone(existing));
        }
        let interned: Arc<str> = Arc::from(text);
        interner.insert(Arc::clone(&interned));
        Identifier(interned)
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Creates a fresh per-query execution context.
    pub fn new_execution_context(&self) -> ExecutionContext {
        ExecutionContext {
            region: Region::new(),
            thread_states: ThreadStateContainer::new(),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-query state threaded through bytecode as an opaque pointer: scratch
/// memory, the thread-state container for parallel operators, and the
/// worker pool.
pub struct ExecutionContext {
    pub region: Region,
    pub thread_states: ThreadStateContainer<'static>,
    pub pool: Arc<WorkerPool>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Engine::new().new_execution_context()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
