//! Query-result cache: caches the key lists returned by
//! tag queries, keyed on a normalized representation of the query
//! itself, so repeated identical queries skip re-walking the tag index.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::query::Operator;
use crate::record::Scope;

/// Build the cache key for a tag query: scope, sorted tags, lowercase
/// operator name and pagination all fold into one string so that
/// semantically identical queries always collide.
pub fn cache_key(
    scope: &Scope,
    tags: &[String],
    operator: Operator,
    page: usize,
    page_size: usize,
) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!(
        "{}\0{}\0{}\0{:?}\0{}\0{}",
        scope.db,
        scope.namespace,
        sorted.join(","),
        operator,
        page,
        page_size
    )
}

struct Entry {
    value: Vec<String>,
    inserted_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    stats: CacheStats,
}

/// Bounded LRU cache of query results with a per-entry TTL.
pub struct QueryCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
                stats: CacheStats::default(),
            }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            inner.stats.misses += 1;
            return None;
        }
        inner.stats.hits += 1;
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            let k = inner.order.remove(pos);
            inner.order.push(k);
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: String, value: Vec<String>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else if inner.entries.len() >= self.capacity {
            if let Some(oldest) = (!inner.order.is_empty()).then(|| inner.order.remove(0)) {
                inner.entries.remove(&oldest);
                inner.stats.evictions += 1;
            }
        }
        inner.entries.insert(key.clone(), Entry { value, inserted_at: now });
        inner.order.push(key);
    }

    /// Drop every cached entry for `scope` (invalidation on any write
    /// within that scope, since a write may change which keys a given
    /// query would return).
    pub fn invalidate_scope(&self, scope: &Scope) {
        let mut inner = self.inner.lock();
        let prefix = format!("{}\0{}\0", scope.db, scope.namespace);
        let stale: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in stale {
            inner.entries.remove(&key);
            inner.order.retain(|k| k != &key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
