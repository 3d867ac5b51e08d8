//! Lazily materialised variable references.
//!
//! Scopes hand out integer references whose contents are computed on first
//! query and memoised. References are thread-owned and live in the low 24
//! bits; the adapter splices the owning thread's id into the bits above so
//! global resolution is `(thread, local)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::protocol::Variable;

/// Local references fit in 24 bits.
pub const LOCAL_REF_BITS: u32 = 24;
pub const LOCAL_REF_MASK: i64 = (1 << LOCAL_REF_BITS) - 1;
/// Thread ids fit in the 8 bits above the local reference.
pub const MAX_THREAD_ID: i64 = (1 << 8) - 1;

/// Compose a global variables reference from a thread id and a local one.
pub fn compose_ref(thread_id: i64, local: i64) -> i64 {
    if local == 0 {
        return 0;
    }
    (thread_id << LOCAL_REF_BITS) | (local & LOCAL_REF_MASK)
}

/// Split a global variables reference into `(thread, local)`.
pub fn split_ref(global: i64) -> (i64, i64) {
    (global >> LOCAL_REF_BITS, global & LOCAL_REF_MASK)
}

type Thunk = Box<dyn FnOnce() -> Vec<Variable> + Send>;

enum Entry {
    Pending(Thunk),
    Done(Vec<Variable>),
}

/// Thread-owned allocator of memoised variable references.
#[derive(Default)]
pub struct VariableRefs {
    next: AtomicI64,
    entries: Mutex<HashMap<i64, Entry>>,
}

impl VariableRefs {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a thunk and return its local reference.
    pub fn alloc<F>(&self, thunk: F) -> i64
    where
        F: FnOnce() -> Vec<Variable> + Send + 'static,
    {
        let id = (self.next.fetch_add(1, Ordering::Relaxed) + 1) & LOCAL_REF_MASK;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Entry::Pending(Box::new(thunk)));
        id
    }

    /// Resolve a reference, running its thunk at most once. Unknown
    /// references resolve to an empty list.
    pub fn get(&self, id: i64) -> Vec<Variable> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.remove(&id) {
            Some(Entry::Pending(thunk)) => {
                let variables = thunk();
                entries.insert(id, Entry::Done(variables.clone()));
                variables
            }
            Some(Entry::Done(variables)) => {
                let result = variables.clone();
                entries.insert(id, Entry::Done(variables));
                result
            }
            None => Vec::new(),
        }
    }

    /// Drop all thunks. Called on resume and on thread death; outstanding
    /// references resolve to empty lists afterwards.
    pub fn reset(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
