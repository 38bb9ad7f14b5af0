//! Per-key lock registry.
//!
//! Operations that read-modify-write a single key (set with TTL
//! refresh, transaction commit, replicated apply) take a lock scoped to
//! that key rather than a single store-wide mutex, so unrelated keys
//! never contend. Entries are held by `Weak` and reclaimed once the last
//! guard drops, so the registry does not grow unboundedly with the
//! lifetime of the store.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::record::{Scope, StoreKey};

fn lock_key(scope: &Scope, key: &StoreKey) -> String {
    format!("{}\0{}\0{}", scope.db, scope.namespace, key.as_str())
}

/// A registry of per-key mutexes, reclaimed when unreferenced.
#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<String, Weak<Mutex<()>>>,
}

/// RAII guard; the underlying lock is released on drop.
pub struct KeyGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire the lock for `(scope, key)`, blocking until available.
    pub fn lock(&self, scope: &Scope, key: &StoreKey) -> KeyGuard {
        let entry = lock_key(scope, key);
        let lock = loop {
            if let Some(existing) = self.locks.get(&entry).and_then(|w| w.upgrade()) {
                break existing;
            }
            let fresh = Arc::new(Mutex::new(()));
            self.locks.insert(entry.clone(), Arc::downgrade(&fresh));
            // Another thread may have raced us to insert; re-check by
            // re-reading so we never hand out two "first" Arcs for the
            // same key.
            if let Some(existing) = self.locks.get(&entry).and_then(|w| w.upgrade()) {
                break existing;
            }
            break fresh;
        };
        let guard = Mutex::lock_arc(&lock);
        KeyGuard { _guard: guard }
    }

    /// Drop entries whose last strong reference has already gone away.
    /// Purely a memory-bound cleanup; correctness does not depend on
    /// calling this.
    pub fn compact(&self) {
        self.locks.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
