//! Per-query in-flight tracking.
//!
//! A query id is marked in flight for as long as its [`InFlightGuard`]
//! lives. The guard travels with the spawned cycle task, so the mark is
//! cleared however the task ends: completion, error, panic or abort.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<i64>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `query_id` in flight. `None` if it already is.
    pub fn try_acquire(&self, query_id: i64) -> Option<InFlightGuard> {
        if !lock(&self.ids).insert(query_id) {
            return None;
        }
        Some(InFlightGuard {
            ids: self.ids.clone(),
            query_id,
        })
    }

    pub fn contains(&self, query_id: i64) -> bool {
        lock(&self.ids).contains(&query_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.ids).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clears the in-flight mark on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<i64>>>,
    query_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.ids).remove(&self.query_id);
    }
}

// A panic while holding the lock cannot leave the set half-updated.
fn lock(ids: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    ids.lock().unwrap_or_else(|e| e.into_inner())
}
