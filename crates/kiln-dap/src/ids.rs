//! Monotonic id allocation.

use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out fresh 64-bit ids, starting at 1. Ids are never recycled: the
/// number of frames and variable references is bounded by program size times
/// a short session lifetime.
#[derive(Debug)]
pub struct IdPool {
    next: AtomicI64,
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}
