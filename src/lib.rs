//!
//! # corestore
//!
//! An embedded, tag-indexed key-value store with pluggable storage
//! backends, transparent compression, short-lived transactions,
//! checksummed backup/restore, and primary/secondary replication.
//!
//! ## Core Concepts
//!
//! ### Backends
//!
//! A [`store::Store`] is backend-agnostic: it reads a
//! [`backend::BackendCapabilities`] descriptor once at construction and
//! routes writes, metadata, and queries accordingly. Two backends ship
//! today:
//! - **filesystem**: values as files under a validated root, metadata in
//!   a sibling [`catalog::Catalog`] (redb-backed)
//! - **networked-kv**: a TCP client/server pair that holds metadata
//!   natively
//!
//! ### Tags and queries
//!
//! Every key can carry an arbitrary set of tags. [`index::TagIndex`]
//! keeps a forward and reverse mapping so AND/OR/NOT tag queries and
//! boolean-combinator [`query::complex_query`]s never scan the whole
//! catalog. [`cache::QueryCache`] caches paginated query results with a
//! short TTL.
//!
//! ### Transactions
//!
//! [`store::Store::transaction`] runs a closure against a
//! [`store::TransactionHandle`]: every `set`/`delete` inside it is
//! staged, then applied atomically if the closure returns `Ok`, or
//! discarded if it returns `Err`. A handle never nests.
//!
//! ### Backup and replication
//!
//! [`backup::BackupManager`] writes full and incremental, checksummed
//! archives. [`replication::primary::ReplicationPrimary`] and
//! [`replication::secondary::ReplicationSecondary`] stream the primary's
//! operation log to secondaries, which apply it through the
//! [`replication::secondary::ReplicaApply`] trait and reject local
//! writes while in that role.
//!
//! ## Quick start
//!
//! ```ignore
//! use corestore::config::StoreConfig;
//! use corestore::store::Store;
//!
//! let config = StoreConfig::builder()
//!     .data_folder_path("./data")
//!     .db("main")
//!     .namespace("default")
//!     .build();
//! let store = Store::open(config)?;
//!
//! store.set("user:1", b"alice", ["active", "admin"])?;
//! let value = store.get("user:1")?;
//! # Ok::<(), corestore::error::StoreError>(())
//! ```
//!
//! ## Error handling
//!
//! Every public operation returns [`error::StoreResult<T>`]. See
//! [`error::StoreError`] for the full taxonomy.

pub mod backend;
pub mod backup;
pub mod buffer;
pub mod cache;
pub mod catalog;
pub mod compress;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod locks;
pub mod query;
pub mod record;
pub mod replication;
pub mod stats;
pub mod store;
pub mod sync;
pub mod txn;
pub mod wire;

pub use error::{StoreError, StoreResult};
pub use store::Store;
