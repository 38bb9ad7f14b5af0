//! Storage backend abstraction layer.
//!
//! Every backend implements [`StorageBackend`] plus a capabilities
//! descriptor the [`crate::store::Store`] reads once at construction
//! to decide whether to route writes through the write buffer, whether
//! to delegate metadata to the catalog, and so on — a single typed
//! interface in place of duck-typing over backend kind.

pub mod filesystem;
pub mod networked;

use crate::error::StoreResult;
use crate::record::{Metadata, Scope};

/// Whether a backend wants writes staged in the in-memory write buffer
/// before being persisted, or written straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    Buffered,
    Immediate,
}

/// Capability descriptor published by a backend, computed once and read
/// by the store at construction.
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    pub supports_buffering: bool,
    pub write_strategy: WriteStrategy,
    pub supports_native_ttl: bool,
    pub supports_metadata: bool,
    pub supports_native_queries: bool,
    pub is_distributed: bool,
    pub supports_compression: bool,
    pub max_value_size_bytes: Option<u64>,
}

/// A page of relative paths returned by [`StorageBackend::list_keys`],
/// plus an opaque cursor for the next page. `next_cursor` is `None` once
/// iteration is exhausted. Backed by a plain `Vec` rather than a lazy
/// stream so that no backend implementation needs to hold a lock across
/// an unbounded scan.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub paths: Vec<String>,
    pub next_cursor: Option<String>,
}

/// Operations every storage backend must expose.
pub trait StorageBackend: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;

    /// Atomic write (write-to-temp + rename, or server-side atomic).
    fn write_data(&self, relative_path: &str, bytes: &[u8]) -> StoreResult<()>;

    fn read_data(&self, relative_path: &str) -> StoreResult<Vec<u8>>;

    /// Idempotent; never fails for an absent path.
    fn delete_file(&self, relative_path: &str) -> StoreResult<()>;

    fn file_exists(&self, relative_path: &str) -> StoreResult<bool>;

    fn get_file_size(&self, relative_path: &str) -> StoreResult<u64>;

    /// Cursor-based iteration, bounded per call. Pass `cursor` back in
    /// from the previous [`ListPage::next_cursor`] to continue.
    fn list_keys(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> StoreResult<ListPage>;
}

/// Extra operations for backends whose `capabilities().supports_metadata`
/// is true.
pub trait NativeMetadataBackend: StorageBackend {
    fn set_metadata(&self, record: &Metadata) -> StoreResult<()>;
    fn get_metadata(&self, scope: &Scope, key: &str) -> StoreResult<Option<Metadata>>;
    fn delete_metadata(&self, scope: &Scope, key: &str) -> StoreResult<()>;
    fn query_metadata(&self, scope: &Scope) -> StoreResult<Vec<Metadata>>;
    /// Returns the records the backend itself determined were expired
    /// and has already reconciled.
    fn cleanup_expired(&self, scope: &Scope, now: i64) -> StoreResult<Vec<Metadata>>;
}
