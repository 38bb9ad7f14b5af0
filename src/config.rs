//! Unified configuration for the store and its collaborators: a
//! `typed-builder` struct per concern with sensible defaults, rather
//! than a loose bag of loosely-typed options.
//!
//! Loading these values from environment variables or a config file is
//! explicitly out of scope for this crate; callers build a
//! [`StoreConfig`] directly or generate one from whatever config layer
//! their application already has.

use std::path::PathBuf;
use std::time::Duration;
use typed_builder::TypedBuilder;

/// Which storage backend a store instance should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Filesystem,
    NetworkedKv,
}

/// Connection parameters for the networked-KV backend.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(doc)]
pub struct ConnectionParams {
    #[builder(default = "127.0.0.1".to_string())]
    pub host: String,
    #[builder(default = 9000)]
    pub port: u16,
    #[builder(default, setter(strip_option))]
    pub auth_token: Option<String>,
    #[builder(default, setter(strip_option))]
    pub db_index: Option<u32>,
    #[builder(default = 16)]
    pub pool_size: usize,
}

/// Replication role a store instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    None,
    Primary,
    Secondary,
}

/// Replication-specific configuration.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(doc)]
pub struct ReplicationConfig {
    #[builder(default = ReplicationMode::None)]
    pub mode: ReplicationMode,
    #[builder(default = "0.0.0.0:9000".to_string())]
    pub listen: String,
    #[builder(default, setter(strip_option))]
    pub primary_endpoint: Option<String>,
    #[builder(default = Duration::from_secs(5))]
    pub heartbeat: Duration,
    #[builder(default = 10_000)]
    pub max_op_log: usize,
}

/// Top-level configuration for a [`crate::store::Store`] instance.
///
/// # Examples
///
/// ```
/// use corestore::config::{StoreConfig, BackendKind};
///
/// let config = StoreConfig::builder()
///     .data_folder_path("./data")
///     .db("main")
///     .namespace("default")
///     .backend(BackendKind::Filesystem)
///     .build();
/// assert_eq!(config.buffer_size_mb, 64);
/// ```
#[derive(Debug, Clone, TypedBuilder)]
#[builder(doc)]
pub struct StoreConfig {
    #[builder(setter(into))]
    pub data_folder_path: PathBuf,
    #[builder(setter(into))]
    pub db: String,
    #[builder(setter(into))]
    pub namespace: String,

    #[builder(default = BackendKind::Filesystem)]
    pub backend: BackendKind,

    #[builder(default = 64)]
    pub buffer_size_mb: usize,
    #[builder(default = Duration::from_secs(5))]
    pub flush_interval: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub ttl_sweep_interval: Duration,
    #[builder(default = true)]
    pub compression_enabled: bool,

    #[builder(default, setter(strip_option))]
    pub connection_params: Option<ConnectionParams>,

    #[builder(default = true)]
    pub enable_transactions: bool,
    #[builder(default = true)]
    pub enable_backup: bool,
    #[builder(default = true)]
    pub enable_indexing: bool,
    #[builder(default = 1000)]
    pub cache_size: usize,
    #[builder(default = Duration::from_secs(300))]
    pub cache_ttl: Duration,

    #[builder(default = ReplicationConfig::builder().build())]
    pub replication: ReplicationConfig,
}

impl StoreConfig {
    /// Path to the sibling metadata catalog file (`<root>/<db>_meta.*`).
    pub fn metadata_catalog_path(&self) -> PathBuf {
        self.data_folder_path.join(format!("{}_meta.redb", self.db))
    }
}
