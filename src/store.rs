//! The `Store` facade: the single entry point tying every
//! collaborator together — backend, catalog, write buffer, tag index,
//! query cache, per-key locks, transactions, backups, the background
//! synchronizer, and replication.
//!
//! Construction reads the backend's [`BackendCapabilities`] once and
//! dispatches every operation accordingly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::filesystem::FilesystemBackend;
use crate::backend::networked::NetworkedBackend;
use crate::backend::{BackendCapabilities, NativeMetadataBackend, StorageBackend, WriteStrategy};
use crate::backup::{BackupManager, LiveEntry, VerifyReport};
use crate::cache::{self, QueryCache};
use crate::catalog::{self, Catalog};
use crate::compress;
use crate::config::{BackendKind, ReplicationMode, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::events::{default_sink, Event, EventSink, Level};
use crate::index::TagIndex;
use crate::locks::LockRegistry;
use crate::query::{self, Condition, Operator};
use crate::record::{self, Metadata, Scope, StoreKey, Tag};
use crate::replication::primary::ReplicationPrimary;
use crate::replication::secondary::{ReplicaApply, ReplicationSecondary};
use crate::replication::ReplicatedOp;
use crate::stats::{QueryStats, Stats};
use crate::sync::{BackgroundSynchronizer, Syncable};
use crate::txn::{Operation, Snapshot, Transaction, TransactionManager};

enum Backend {
    Filesystem(FilesystemBackend),
    Networked(NetworkedBackend),
}

impl Backend {
    fn capabilities(&self) -> BackendCapabilities {
        match self {
            Backend::Filesystem(b) => b.capabilities(),
            Backend::Networked(b) => b.capabilities(),
        }
    }

    fn write_data(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        match self {
            Backend::Filesystem(b) => b.write_data(path, bytes),
            Backend::Networked(b) => b.write_data(path, bytes),
        }
    }

    fn read_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        match self {
            Backend::Filesystem(b) => b.read_data(path),
            Backend::Networked(b) => b.read_data(path),
        }
    }

    fn delete_file(&self, path: &str) -> StoreResult<()> {
        match self {
            Backend::Filesystem(b) => b.delete_file(path),
            Backend::Networked(b) => b.delete_file(path),
        }
    }

    fn native(&self) -> Option<&dyn NativeMetadataBackend> {
        match self {
            Backend::Filesystem(_) => None,
            Backend::Networked(b) => Some(b),
        }
    }
}

/// Page of keys returned by [`Store::query_by_tags_advanced`] and
/// [`Store::complex_query`].
#[derive(Debug, Clone)]
pub struct PagedQueryResult {
    pub keys: Vec<String>,
    pub total: usize,
    pub has_more: bool,
    pub execution_ms: u64,
    pub cache_hit: bool,
}

/// Constraints for [`Store::query_metadata`]; every `Some` field
/// narrows the match and all present constraints are ANDed together.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataFilter<'a> {
    /// Keys must carry every tag listed (intersection, not union).
    pub tags: Option<&'a [Tag]>,
    /// Inclusive `(min, max)` byte size.
    pub size_range: Option<(u64, u64)>,
    /// `Some(true)` matches only records with a TTL set, `Some(false)`
    /// only records without one.
    pub has_ttl: Option<bool>,
    /// A `%`/`_` glob pattern; embed literal fragments via
    /// [`crate::catalog::escape_like_literal`] first.
    pub key_pattern: Option<&'a str>,
}

/// Handle passed into the closure given to [`Store::transaction`]; every
/// write through it is staged against the enclosing transaction instead
/// of touching the store directly.
pub struct TransactionHandle<'a> {
    store: &'a Store,
}

impl<'a> TransactionHandle<'a> {
    pub fn set(&self, key: &str, value: &[u8], tags: impl IntoIterator<Item = impl Into<Tag>>) -> StoreResult<()> {
        self.store.set(key, value, tags)
    }

    pub fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: u64,
        tags: impl IntoIterator<Item = impl Into<Tag>>,
    ) -> StoreResult<()> {
        self.store.set_with_ttl(key, value, ttl_seconds, tags)
    }

    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.store.delete(key)
    }

    pub fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.store.get(key)
    }
}

/// The embedded key-value store. Construct via [`Store::open`].
pub struct Store {
    config: StoreConfig,
    scope: Scope,
    backend: Backend,
    capabilities: BackendCapabilities,
    catalog: Option<Catalog>,
    buffer: Option<crate::buffer::WriteBuffer>,
    index: TagIndex,
    cache: QueryCache,
    locks: LockRegistry,
    txn: TransactionManager,
    backup: Option<BackupManager>,
    sink: Arc<dyn EventSink>,
    started_at: Instant,
    queries_executed: AtomicU64,
    tag_lookups: AtomicU64,
    replication_primary: Option<Arc<ReplicationPrimary>>,
    replication_secondary: Option<Arc<ReplicationSecondary>>,
    read_only: AtomicBool,
    /// Kept alive for the store's lifetime; its `Drop` stops the thread.
    synchronizer: Arc<BackgroundSynchronizer>,
}

impl Store {
    pub fn open(config: StoreConfig) -> StoreResult<Arc<Self>> {
        Self::open_with_sink(config, default_sink())
    }

    pub fn open_with_sink(config: StoreConfig, sink: Arc<dyn EventSink>) -> StoreResult<Arc<Self>> {
        let scope = Scope::new(config.db.clone(), config.namespace.clone());
        let backend = match config.backend {
            BackendKind::Filesystem => Backend::Filesystem(FilesystemBackend::new(&config.data_folder_path)?),
            BackendKind::NetworkedKv => {
                let params = config.connection_params.clone().ok_or_else(|| {
                    StoreError::InvalidArgument("networked-kv backend requires connection_params".into())
                })?;
                Backend::Networked(NetworkedBackend::connect(params.host, params.port, params.pool_size))
            }
        };
        let capabilities = backend.capabilities();

        let catalog = if capabilities.supports_metadata {
            None
        } else {
            Some(Catalog::open(config.metadata_catalog_path())?)
        };
        let buffer = match capabilities.write_strategy {
            WriteStrategy::Buffered => Some(crate::buffer::WriteBuffer::new(config.buffer_size_mb * 1024 * 1024)),
            WriteStrategy::Immediate => None,
        };
        let backup = if config.enable_backup {
            Some(BackupManager::new(config.data_folder_path.join("backups"))?)
        } else {
            None
        };
        let read_only = AtomicBool::new(config.replication.mode == ReplicationMode::Secondary);

        let replication_primary = match config.replication.mode {
            ReplicationMode::Primary => {
                let primary = ReplicationPrimary::new(config.replication.max_op_log);
                primary.serve(&config.replication.listen, config.replication.heartbeat)?;
                Some(primary)
            }
            _ => None,
        };
        let replication_secondary = match config.replication.mode {
            ReplicationMode::Secondary => {
                let endpoint = config.replication.primary_endpoint.clone().ok_or_else(|| {
                    StoreError::InvalidArgument("secondary replication requires primary_endpoint".into())
                })?;
                Some(Arc::new(ReplicationSecondary::new(endpoint).with_sink(Arc::clone(&sink))))
            }
            _ => None,
        };

        let cache = QueryCache::new(config.cache_size, config.cache_ttl);
        // One tick drives both flush and TTL sweep (sync.rs runs them
        // together); use the tighter of the two configured cadences so
        // neither budget is starved.
        let sync_interval = config.flush_interval.min(config.ttl_sweep_interval);
        let synchronizer = Arc::new(BackgroundSynchronizer::new(sync_interval).with_sink(Arc::clone(&sink)));
        let store = Arc::new(Self {
            config,
            scope,
            backend,
            capabilities,
            catalog,
            buffer,
            index: TagIndex::new(),
            cache,
            locks: LockRegistry::new(),
            txn: TransactionManager::new(),
            backup,
            sink,
            started_at: Instant::now(),
            queries_executed: AtomicU64::new(0),
            tag_lookups: AtomicU64::new(0),
            replication_primary,
            replication_secondary,
            read_only,
            synchronizer,
        });

        store.rebuild_index()?;

        store.synchronizer.register(Arc::downgrade(&store) as std::sync::Weak<dyn Syncable>);
        store.synchronizer.start();

        if let Some(secondary) = &store.replication_secondary {
            let secondary = Arc::clone(secondary);
            let store_for_apply = Arc::clone(&store);
            std::thread::spawn(move || secondary.run(store_for_apply.as_ref()));
        }

        Ok(store)
    }

    fn rebuild_index(&self) -> StoreResult<()> {
        if !self.config.enable_indexing {
            return Ok(());
        }
        for record in self.all_metadata()? {
            self.index.set_tags(&self.scope, record.key.as_str(), &record.tags);
        }
        Ok(())
    }

    fn all_metadata(&self) -> StoreResult<Vec<Metadata>> {
        match &self.catalog {
            Some(catalog) => catalog.query_scope(&self.scope),
            None => match self.backend.native() {
                Some(native) => native.query_metadata(&self.scope),
                None => Ok(Vec::new()),
            },
        }
    }

    fn get_metadata_record(&self, key: &str) -> StoreResult<Option<Metadata>> {
        match &self.catalog {
            Some(catalog) => catalog.get(&self.scope, key),
            None => self
                .backend
                .native()
                .expect("capabilities without a catalog always expose native metadata")
                .get_metadata(&self.scope, key),
        }
    }

    fn upsert_metadata_record(&self, record: &Metadata) -> StoreResult<()> {
        match &self.catalog {
            Some(catalog) => catalog.upsert(record),
            None => self
                .backend
                .native()
                .expect("capabilities without a catalog always expose native metadata")
                .set_metadata(record),
        }
    }

    fn delete_metadata_record(&self, key: &str) -> StoreResult<Option<Metadata>> {
        match &self.catalog {
            Some(catalog) => catalog.delete(&self.scope, key),
            None => {
                let native = self
                    .backend
                    .native()
                    .expect("capabilities without a catalog always expose native metadata");
                let existing = native.get_metadata(&self.scope, key)?;
                native.delete_metadata(&self.scope, key)?;
                Ok(existing)
            }
        }
    }

    /// Raw on-disk bytes for `meta` (compression frame intact), from the
    /// write buffer if the entry hasn't drained yet, else the backend.
    fn read_raw_bytes(&self, meta: &Metadata) -> StoreResult<Vec<u8>> {
        if let Some(buffer) = &self.buffer {
            if let Some(pending) = buffer.peek(&self.scope, &meta.key) {
                return Ok(pending.bytes);
            }
        }
        self.backend.read_data(&meta.path)
    }

    fn read_value(&self, meta: &Metadata) -> StoreResult<Vec<u8>> {
        compress::decode(&self.read_raw_bytes(meta)?)
    }

    fn persist_entry(&self, meta: &Metadata, value: &[u8]) -> StoreResult<()> {
        let framed = compress::encode(value, self.config.compression_enabled)?;
        self.persist_framed(meta, framed)
    }

    /// Write already-framed (compressed-or-not) bytes straight through,
    /// skipping [`compress::encode`] — used by backup restore, where the
    /// archived value is the on-disk frame already.
    fn persist_framed(&self, meta: &Metadata, framed: Vec<u8>) -> StoreResult<()> {
        match self.capabilities.write_strategy {
            WriteStrategy::Buffered => {
                let buffer = self.buffer.as_ref().expect("buffered backend always has a buffer");
                if buffer.stage(&self.scope, &meta.key, meta.path.clone(), framed) {
                    // High-water mark crossed: schedule a flush on the
                    // background synchronizer rather than draining here,
                    // under the caller's per-key lock.
                    self.synchronizer.trigger();
                }
            }
            WriteStrategy::Immediate => {
                self.backend.write_data(&meta.path, &framed)?;
            }
        }
        self.upsert_metadata_record(meta)?;
        if self.config.enable_indexing {
            self.index.set_tags(&self.scope, meta.key.as_str(), &meta.tags);
        }
        self.cache.invalidate_scope(&self.scope);
        Ok(())
    }

    fn apply_set(&self, key: &StoreKey, value: &[u8], tags: &BTreeSet<Tag>, ttl_seconds: Option<u64>) -> StoreResult<()> {
        let _guard = self.locks.lock(&self.scope, key);
        let now = record::now_unix();
        let created_at = match self.get_metadata_record(key.as_str())? {
            Some(existing) => existing.created_at,
            None => now,
        };
        let metadata = Metadata {
            path: record::derive_path(&self.scope, key),
            scope: self.scope.clone(),
            key: key.clone(),
            size: value.len() as u64,
            created_at,
            last_updated: now,
            last_accessed: now,
            ttl_seconds,
            tags: tags.clone(),
        };
        self.persist_entry(&metadata, value)
    }

    fn apply_delete(&self, key: &StoreKey) -> StoreResult<()> {
        let _guard = self.locks.lock(&self.scope, key);
        let Some(metadata) = self.delete_metadata_record(key.as_str())? else {
            return Err(StoreError::NotFound);
        };
        if let Some(buffer) = &self.buffer {
            buffer.discard(&self.scope, key);
        }
        self.backend.delete_file(&metadata.path)?;
        if self.config.enable_indexing {
            self.index.remove_key(&self.scope, key.as_str());
        }
        self.cache.invalidate_scope(&self.scope);
        Ok(())
    }

    fn raw_set(&self, key: &StoreKey, value: &[u8], tags: &BTreeSet<Tag>, ttl_seconds: Option<u64>) -> StoreResult<()> {
        if self.read_only.load(Ordering::Relaxed) {
            return Err(StoreError::ReadOnly);
        }
        self.apply_set(key, value, tags, ttl_seconds)?;
        if let Some(primary) = &self.replication_primary {
            primary.broadcast(ReplicatedOp::Set {
                scope: self.scope.clone(),
                key: key.as_str().to_string(),
                value: value.to_vec(),
                tags: tags.clone(),
                ttl_seconds,
            });
        }
        Ok(())
    }

    fn raw_delete(&self, key: &StoreKey) -> StoreResult<()> {
        if self.read_only.load(Ordering::Relaxed) {
            return Err(StoreError::ReadOnly);
        }
        self.apply_delete(key)?;
        if let Some(primary) = &self.replication_primary {
            primary.broadcast(ReplicatedOp::Delete { scope: self.scope.clone(), key: key.as_str().to_string() });
        }
        Ok(())
    }

    fn dispatch_write(&self, key: &str, value: &[u8], tags: BTreeSet<Tag>, ttl_seconds: Option<u64>) -> StoreResult<()> {
        let store_key = StoreKey::new(key)?;
        if self.txn.is_active() {
            return self.txn.with_active(|txn| {
                self.remember_snapshot(txn, &store_key)?;
                txn.stage_set(store_key.as_str().to_string(), value.to_vec(), tags, ttl_seconds);
                Ok(())
            });
        }
        let started = Instant::now();
        let result = self.raw_set(&store_key, value, &tags, ttl_seconds);
        self.sink.emit(
            Event::new(Level::Debug, "store", "set")
                .with_duration(started.elapsed())
                .attr("key", store_key.as_str()),
        );
        result
    }

    fn remember_snapshot(&self, txn: &mut Transaction, key: &StoreKey) -> StoreResult<()> {
        if txn.snapshots().contains_key(key.as_str()) {
            return Ok(());
        }
        let snapshot = match self.get_metadata_record(key.as_str())? {
            Some(meta) if !meta.is_expired(record::now_unix()) => {
                let value = self.read_value(&meta)?;
                Snapshot::Present { value, tags: meta.tags, ttl_seconds: meta.ttl_seconds }
            }
            _ => Snapshot::Absent,
        };
        txn.remember(key.as_str(), || snapshot);
        Ok(())
    }

    /// Set `key` to `value` with `tags`. Inside an active transaction
    /// this only enqueues the operation.
    pub fn set(&self, key: &str, value: &[u8], tags: impl IntoIterator<Item = impl Into<Tag>>) -> StoreResult<()> {
        let tags: BTreeSet<Tag> = tags.into_iter().map(Into::into).collect();
        self.dispatch_write(key, value, tags, None)
    }

    pub fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: u64,
        tags: impl IntoIterator<Item = impl Into<Tag>>,
    ) -> StoreResult<()> {
        if ttl_seconds == 0 {
            return Err(StoreError::InvalidArgument("ttl_seconds must be greater than zero".into()));
        }
        let tags: BTreeSet<Tag> = tags.into_iter().map(Into::into).collect();
        self.dispatch_write(key, value, tags, Some(ttl_seconds))
    }

    fn read_key(&self, key: &str) -> StoreResult<(Vec<u8>, Metadata)> {
        let store_key = StoreKey::new(key)?;
        let _guard = self.locks.lock(&self.scope, &store_key);
        let meta = self.get_metadata_record(store_key.as_str())?.ok_or(StoreError::NotFound)?;
        if meta.is_expired(record::now_unix()) {
            return Err(StoreError::NotFound);
        }
        let value = self.read_value(&meta)?;
        let mut refreshed = meta;
        refreshed.last_accessed = record::now_unix();
        // Best-effort: a failure to persist the access-time bump must
        // not fail the read itself.
        let _ = self.upsert_metadata_record(&refreshed);
        Ok((value, refreshed))
    }

    pub fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.read_key(key).map(|(value, _)| value)
    }

    pub fn get_with_metadata(&self, key: &str) -> StoreResult<(Vec<u8>, Metadata)> {
        self.read_key(key)
    }

    /// Delete `key`. Inside an active transaction this only enqueues the
    /// operation.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let store_key = StoreKey::new(key)?;
        if self.txn.is_active() {
            return self.txn.with_active(|txn| {
                self.remember_snapshot(txn, &store_key)?;
                txn.stage_delete(store_key.as_str().to_string());
                Ok(())
            });
        }
        self.raw_delete(&store_key)
    }

    /// Keys carrying every tag in `tags` (AND), with their metadata.
    pub fn query_by_tags(&self, tags: &[Tag]) -> StoreResult<BTreeMap<String, Metadata>> {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.tag_lookups.fetch_add(tags.len() as u64, Ordering::Relaxed);
        let keys = query::query_tags(&self.index, &self.scope, tags, Operator::And);
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(meta) = self.get_metadata_record(&key)? {
                out.insert(key, meta);
            }
        }
        Ok(out)
    }

    /// Paginated tag query with an explicit combinator, backed by the
    /// query-result cache.
    pub fn query_by_tags_advanced(&self, tags: &[Tag], operator: Operator, page: usize, page_size: usize) -> PagedQueryResult {
        let started = Instant::now();
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.tag_lookups.fetch_add(tags.len() as u64, Ordering::Relaxed);

        let cache_key = cache::cache_key(&self.scope, tags, operator, page, page_size);
        let cached = self.cache.get(&cache_key);
        let cache_hit = cached.is_some();
        let matches = query::query_tags(&self.index, &self.scope, tags, operator);
        let total = matches.len();
        let page_keys = match cached {
            Some(keys) => keys,
            None => {
                let paged = query::paginate(&matches, page, page_size);
                self.cache.put(cache_key, paged.clone());
                paged
            }
        };
        let has_more = page.saturating_add(1).saturating_mul(page_size) < total;
        PagedQueryResult {
            keys: page_keys,
            total,
            has_more,
            execution_ms: started.elapsed().as_millis() as u64,
            cache_hit,
        }
    }

    /// Metadata search across tags/size/ttl/key-pattern together, all
    /// present constraints ANDed. Backed by the metadata catalog; a
    /// backend that holds metadata natively instead (the networked-KV
    /// backend) does not support this combined form yet.
    pub fn query_metadata(&self, filter: MetadataFilter<'_>) -> StoreResult<Vec<Metadata>> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| StoreError::InvalidState("query_metadata requires a metadata catalog".into()))?;
        catalog.query_metadata(&catalog::MetadataQuery {
            scope: &self.scope,
            tags: filter.tags,
            size_range: filter.size_range,
            has_ttl: filter.has_ttl,
            key_pattern: filter.key_pattern,
        })
    }

    /// Left-folded boolean combination of tag conditions.
    pub fn complex_query(&self, conditions: &[Condition], page: usize, page_size: usize) -> PagedQueryResult {
        let started = Instant::now();
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.tag_lookups.fetch_add(conditions.len() as u64, Ordering::Relaxed);
        let matches = query::complex_query(&self.index, &self.scope, conditions);
        let total = matches.len();
        let page_keys = query::paginate(&matches, page, page_size);
        let has_more = page.saturating_add(1).saturating_mul(page_size) < total;
        PagedQueryResult {
            keys: page_keys,
            total,
            has_more,
            execution_ms: started.elapsed().as_millis() as u64,
            cache_hit: false,
        }
    }

    /// Every tag currently in use within this store's scope, with how
    /// many live keys carry it.
    pub fn list_all_tags(&self) -> BTreeMap<Tag, usize> {
        let mut out: BTreeMap<Tag, usize> = BTreeMap::new();
        for key in self.index.all_keys(&self.scope) {
            for tag in self.index.tags_for_key(&self.scope, &key) {
                *out.entry(tag).or_insert(0) += 1;
            }
        }
        out
    }

    /// Write every buffered entry through to the backend. An entry whose
    /// write fails is re-staged (so it is not silently lost) and the
    /// remaining entries are still attempted; the first failure is
    /// reported once every entry has been tried.
    fn drain_and_persist(&self) -> StoreResult<()> {
        let Some(buffer) = &self.buffer else { return Ok(()) };
        let mut first_error = None;
        for pending in buffer.drain() {
            if let Err(err) = self.backend.write_data(&pending.path, &pending.bytes) {
                self.sink.emit(
                    Event::new(Level::Warn, "store", "flush")
                        .failed()
                        .attr("path", pending.path.clone()),
                );
                buffer.stage(&pending.scope, &pending.key, pending.path, pending.bytes);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush every buffered write to the backend.
    pub fn flush(&self) -> StoreResult<()> {
        self.drain_and_persist()
    }

    fn run_ttl_sweep(&self) -> StoreResult<usize> {
        let now = record::now_unix();
        let expired = match &self.catalog {
            Some(catalog) => catalog.cleanup_expired(&self.scope, now)?,
            None => self
                .backend
                .native()
                .expect("capabilities without a catalog always expose native metadata")
                .cleanup_expired(&self.scope, now)?,
        };
        for record in &expired {
            self.backend.delete_file(&record.path)?;
            if let Some(buffer) = &self.buffer {
                buffer.discard(&self.scope, &record.key);
            }
            if self.config.enable_indexing {
                self.index.remove_key(&self.scope, record.key.as_str());
            }
            if let Some(primary) = &self.replication_primary {
                primary.broadcast(ReplicatedOp::Delete { scope: self.scope.clone(), key: record.key.as_str().to_string() });
            }
        }
        if !expired.is_empty() {
            self.cache.invalidate_scope(&self.scope);
        }
        Ok(expired.len())
    }

    pub fn stats(&self) -> Stats {
        Stats {
            key_count: self.all_metadata().map(|v| v.len()).unwrap_or(0),
            cache_stats: self.cache.stats(),
            query_stats: QueryStats {
                queries_executed: self.queries_executed.load(Ordering::Relaxed),
                tag_lookups: self.tag_lookups.load(Ordering::Relaxed),
            },
            active_transactions: if self.txn.is_active() { 1 } else { 0 },
            buffer_bytes: self.buffer.as_ref().map(|b| b.byte_size()).unwrap_or(0),
            uptime_s: self.started_at.elapsed().as_secs(),
        }
    }

    /// Run `body` inside a transaction: every `set`/`delete` through
    /// `handle` is staged, then applied atomically if `body` returns
    /// `Ok`, or discarded untouched if it returns `Err`.
    pub fn transaction<T>(&self, body: impl FnOnce(&TransactionHandle) -> StoreResult<T>) -> StoreResult<T> {
        if !self.config.enable_transactions {
            return Err(StoreError::InvalidState("transactions are disabled for this store".into()));
        }
        self.txn.begin(self.scope.clone())?;
        let handle = TransactionHandle { store: self };
        match body(&handle) {
            Ok(value) => match self.commit_transaction() {
                Ok(()) => Ok(value),
                Err(e) => Err(e),
            },
            Err(e) => {
                self.txn.rollback()?;
                Err(e)
            }
        }
    }

    fn commit_transaction(&self) -> StoreResult<()> {
        self.txn.commit(|txn| {
            for op in txn.operations() {
                if let Err(e) = self.apply_committed_operation(op) {
                    for key in txn.snapshot_order_reversed() {
                        let _ = self.restore_snapshot(key, txn);
                    }
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    fn apply_committed_operation(&self, op: &Operation) -> StoreResult<()> {
        match op {
            Operation::Set { key, value, tags, ttl_seconds } => {
                let store_key = StoreKey::new(key.clone())?;
                self.raw_set(&store_key, value, tags, *ttl_seconds)
            }
            Operation::Delete { key } => {
                let store_key = StoreKey::new(key.clone())?;
                match self.raw_delete(&store_key) {
                    Ok(()) | Err(StoreError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn restore_snapshot(&self, key: &str, txn: &Transaction) -> StoreResult<()> {
        let store_key = StoreKey::new(key.to_string())?;
        match txn.snapshots().get(key) {
            Some(Snapshot::Present { value, tags, ttl_seconds }) => self.raw_set(&store_key, value, tags, *ttl_seconds),
            _ => match self.raw_delete(&store_key) {
                Ok(()) | Err(StoreError::NotFound) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    fn live_entries(&self) -> StoreResult<Vec<LiveEntry>> {
        let mut entries = Vec::new();
        for meta in self.all_metadata()? {
            let value = self.read_raw_bytes(&meta)?;
            entries.push(LiveEntry { metadata: meta, value });
        }
        Ok(entries)
    }

    fn backup_manager(&self) -> StoreResult<&BackupManager> {
        self.backup.as_ref().ok_or_else(|| StoreError::InvalidState("backups are disabled for this store".into()))
    }

    /// Archive every live key under this store's scope.
    pub fn backup_full(&self, name: &str) -> StoreResult<String> {
        let backup = self.backup_manager()?;
        backup.backup_full(name, self.live_entries()?.into_iter(), record::now_unix())
    }

    /// Archive only keys changed since `parent` was created.
    pub fn backup_incremental(&self, name: &str, parent: &str) -> StoreResult<String> {
        let backup = self.backup_manager()?;
        let parent_created_at = backup.created_at(parent)?;
        let entries = self.live_entries()?.into_iter().filter(|e| e.metadata.last_updated > parent_created_at);
        backup.backup_incremental(name, parent, entries, record::now_unix())
    }

    pub fn verify_backup(&self, name: &str) -> StoreResult<VerifyReport> {
        self.backup_manager()?.verify(name)
    }

    /// Restore `name`'s full dependency chain, optionally clearing every
    /// currently-live key first.
    pub fn restore_backup(&self, name: &str, clear_existing: bool) -> StoreResult<VerifyReport> {
        if clear_existing {
            for meta in self.all_metadata()? {
                let _ = self.raw_delete(&meta.key);
            }
        }
        self.backup_manager()?.restore(name, |meta, value| self.persist_framed(&meta, value))
    }

    pub fn cleanup_old_backups(&self, now: i64, keep_days: i64, keep_count: usize) -> StoreResult<Vec<String>> {
        self.backup_manager()?.cleanup_old_backups(now, keep_days, keep_count)
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Stop the background synchronizer and any replication threads this
    /// store owns.
    /// Idempotent. The replication secondary's worker thread holds its
    /// own `Arc<Store>` clone for the duration of its run loop, so call
    /// this before dropping the last external handle to a secondary
    /// store or that thread (and the store behind it) never exits.
    pub fn shutdown(&self) {
        self.synchronizer.stop();
        if let Some(primary) = &self.replication_primary {
            primary.stop();
        }
        if let Some(secondary) = &self.replication_secondary {
            secondary.stop();
        }
    }
}

impl Syncable for Store {
    fn flush_buffer(&self) -> StoreResult<()> {
        self.drain_and_persist()
    }

    fn sweep_expired(&self) -> StoreResult<usize> {
        self.run_ttl_sweep()
    }
}

impl ReplicaApply for Store {
    fn apply(&self, op: &ReplicatedOp) -> StoreResult<()> {
        match op {
            ReplicatedOp::Set { key, value, tags, ttl_seconds, .. } => {
                let store_key = StoreKey::new(key.clone())?;
                self.apply_set(&store_key, value, tags, *ttl_seconds)
            }
            ReplicatedOp::Delete { key, .. } => {
                let store_key = StoreKey::new(key.clone())?;
                match self.apply_delete(&store_key) {
                    Ok(()) | Err(StoreError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }
}
