//! Filesystem storage backend.
//!
//! Values are persisted as opaque files under a validated root
//! directory; metadata is delegated entirely to the
//! [`crate::catalog::Catalog`] component, since this backend does not
//! hold metadata of its own.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{BackendCapabilities, ListPage, StorageBackend, WriteStrategy};
use crate::error::{StoreError, StoreResult};
use crate::record::Scope;

/// A backend that stores each value as a file under `root`.
pub struct FilesystemBackend {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FilesystemBackend {
    /// Validate and create `root`, returning a backend rooted there.
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Validate `relative_path` does not escape `root` after
    /// normalization.
    fn resolve(&self, relative_path: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(relative_path);
        if rel.is_absolute() {
            return Err(StoreError::PathTraversal(relative_path.to_string()));
        }
        let mut normalized = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StoreError::PathTraversal(relative_path.to_string()));
                }
            }
        }
        Ok(self.root.join(normalized))
    }

    fn scope_dir(&self, scope: &Scope) -> PathBuf {
        self.root.join(&scope.db)
    }
}

impl StorageBackend for FilesystemBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_buffering: true,
            write_strategy: WriteStrategy::Buffered,
            supports_native_ttl: false,
            supports_metadata: false,
            supports_native_queries: false,
            is_distributed: false,
            supports_compression: true,
            max_value_size_bytes: None,
        }
    }

    fn write_data(&self, relative_path: &str, bytes: &[u8]) -> StoreResult<()> {
        let final_path = self.resolve(relative_path)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let counter = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = final_path.with_extension(format!("tmp.{}.{}", std::process::id(), counter));
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn read_data(&self, relative_path: &str) -> StoreResult<Vec<u8>> {
        let path = self.resolve(relative_path)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_file(&self, relative_path: &str) -> StoreResult<()> {
        let path = self.resolve(relative_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn file_exists(&self, relative_path: &str) -> StoreResult<bool> {
        let path = self.resolve(relative_path)?;
        Ok(path.is_file())
    }

    fn get_file_size(&self, relative_path: &str) -> StoreResult<u64> {
        let path = self.resolve(relative_path)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> StoreResult<ListPage> {
        let dir = self.scope_dir(scope);
        if !dir.exists() {
            return Ok(ListPage::default());
        }
        let mut all_paths = Vec::new();
        collect_files(&dir, &self.root, &mut all_paths)?;
        all_paths.sort();

        let start = match cursor {
            Some(after) => all_paths
                .iter()
                .position(|p| p.as_str() == after)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        let end = (start + batch_size).min(all_paths.len());
        let page = all_paths[start..end].to_vec();
        let next_cursor = if end < all_paths.len() {
            page.last().cloned()
        } else {
            None
        };
        Ok(ListPage {
            paths: page,
            next_cursor,
        })
    }
}

fn collect_files(dir: &Path, root: &Path, out: &mut Vec<String>) -> StoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, root, out)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.contains(".tmp.") {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(())
}
