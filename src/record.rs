//! Core data model: keys, scopes and metadata records.

use std::collections::BTreeSet;

use crate::error::{StoreError, StoreResult};

/// Upper bound on key length, in bytes (spec recommendation).
pub const MAX_KEY_LEN: usize = 1024;

/// A non-empty, length-bounded UTF-8 key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, bincode::Encode, bincode::Decode)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(key: impl Into<String>) -> StoreResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("key must not be empty".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `(database, namespace)` pair that scopes every key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, bincode::Encode, bincode::Decode)]
pub struct Scope {
    pub db: String,
    pub namespace: String,
}

impl Scope {
    pub fn new(db: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            namespace: namespace.into(),
        }
    }
}

/// A short UTF-8 label attached to a key; many-to-many with keys.
pub type Tag = String;

/// Durable record describing one stored key, independent of where the
/// value bytes themselves live (buffer, backend file, or networked
/// backend).
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Metadata {
    /// Backend-relative storage path, deterministic from `(scope, key)`.
    pub path: String,
    pub scope: Scope,
    pub key: StoreKey,
    /// Original, uncompressed size in bytes.
    pub size: u64,
    pub created_at: i64,
    pub last_updated: i64,
    pub last_accessed: i64,
    pub ttl_seconds: Option<u64>,
    pub tags: BTreeSet<Tag>,
}

impl Metadata {
    pub fn is_expired(&self, now: i64) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now >= self.last_updated.saturating_add(ttl as i64),
            None => false,
        }
    }
}

/// Derive the backend-relative path `<db>/<h0:2>/<h2:4>/<h>` for a
/// `(namespace, key)` pair, where `h` is the hex blake3 digest of the
/// namespace and key bytes concatenated with a separator.
pub fn derive_path(scope: &Scope, key: &StoreKey) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(scope.namespace.as_bytes());
    hasher.update(b"\0");
    hasher.update(key.as_str().as_bytes());
    let digest = hasher.finalize();
    let hex = digest.to_hex();
    format!("{}/{}/{}/{}", scope.db, &hex[0..2], &hex[2..4], hex.as_str())
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
