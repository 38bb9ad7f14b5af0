//! Aggregate store statistics exposed by `stats()`.

use crate::cache::CacheStats;

/// Query-engine counters layered on top of the raw cache stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStats {
    pub queries_executed: u64,
    pub tag_lookups: u64,
}

/// Snapshot returned by [`crate::store::Store::stats`].
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub key_count: usize,
    pub cache_stats: CacheStats,
    pub query_stats: QueryStats,
    pub active_transactions: usize,
    pub buffer_bytes: usize,
    pub uptime_s: u64,
}
