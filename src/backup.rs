//! Backup and restore: full and incremental archives of
//! a scope's metadata and value bytes, checksummed entry-by-entry so
//! partial corruption is detected at restore/verify time rather than
//! silently accepted.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};
use crate::record::{Metadata, Scope};
use crate::wire;

/// One archived key: its metadata, raw (already-compressed-on-disk)
/// value bytes, and a checksum over both so [`verify`] can detect
/// corruption without fully restoring anything.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct ArchiveEntry {
    metadata: Metadata,
    value: Vec<u8>,
    checksum: [u8; 32],
}

impl ArchiveEntry {
    fn new(metadata: Metadata, value: Vec<u8>) -> Self {
        let checksum = checksum_of(&metadata, &value);
        Self { metadata, value, checksum }
    }

    fn is_valid(&self) -> bool {
        checksum_of(&self.metadata, &self.value) == self.checksum
    }
}

fn checksum_of(metadata: &Metadata, value: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(metadata.path.as_bytes());
    hasher.update(value);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
enum ArchiveKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct ArchiveHeader {
    kind: ArchiveKind,
    created_at: i64,
    /// Path of the backup this one is incremental against, if any.
    parent: Option<String>,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct Archive {
    header: ArchiveHeader,
    entries: Vec<ArchiveEntry>,
}

/// A single key-value pair as read from the live store, supplied by the
/// caller since the backup manager itself has no storage access.
pub struct LiveEntry {
    pub metadata: Metadata,
    pub value: Vec<u8>,
}

/// Report returned by [`BackupManager::verify`].
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub total_entries: usize,
    pub corrupt_entries: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt_entries.is_empty()
    }
}

/// Creates, verifies and restores backup archives under a directory.
pub struct BackupManager {
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let backup_dir = backup_dir.into();
        std::fs::create_dir_all(&backup_dir)?;
        Ok(Self { backup_dir })
    }

    fn archive_path(&self, name: &str) -> PathBuf {
        self.backup_dir.join(format!("{name}.corebackup"))
    }

    /// Write a full backup of every supplied entry, returning the
    /// backup's file name.
    pub fn backup_full(&self, name: &str, entries: impl Iterator<Item = LiveEntry>, created_at: i64) -> StoreResult<String> {
        let archive = Archive {
            header: ArchiveHeader { kind: ArchiveKind::Full, created_at, parent: None },
            entries: entries.map(|e| ArchiveEntry::new(e.metadata, e.value)).collect(),
        };
        self.write_archive(name, &archive)?;
        Ok(name.to_string())
    }

    /// Write a backup containing only entries changed since `parent`
    /// (the caller determines "changed" by comparing `last_updated`
    /// against the parent backup's `created_at`; this manager only
    /// persists whatever it's given).
    pub fn backup_incremental(
        &self,
        name: &str,
        parent: &str,
        entries: impl Iterator<Item = LiveEntry>,
        created_at: i64,
    ) -> StoreResult<String> {
        if !self.archive_path(parent).exists() {
            return Err(StoreError::InvalidArgument(format!("parent backup '{parent}' does not exist")));
        }
        let archive = Archive {
            header: ArchiveHeader {
                kind: ArchiveKind::Incremental,
                created_at,
                parent: Some(parent.to_string()),
            },
            entries: entries.map(|e| ArchiveEntry::new(e.metadata, e.value)).collect(),
        };
        self.write_archive(name, &archive)?;
        Ok(name.to_string())
    }

    fn write_archive(&self, name: &str, archive: &Archive) -> StoreResult<()> {
        let encoded = wire::encode(archive)?;
        let path = self.archive_path(name);
        let tmp = path.with_extension("corebackup.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// The `created_at` timestamp an existing archive was written with,
    /// so callers can filter "changed since" entries for an incremental
    /// backup against it without parsing the archive themselves.
    pub fn created_at(&self, name: &str) -> StoreResult<i64> {
        Ok(self.read_archive(name)?.header.created_at)
    }

    fn read_archive(&self, name: &str) -> StoreResult<Archive> {
        let path = self.archive_path(name);
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                e.into()
            }
        })?;
        wire::decode(&bytes)
    }

    /// The full chain of archives `name` depends on, oldest first,
    /// including `name` itself.
    fn resolve_chain(&self, name: &str) -> StoreResult<Vec<Archive>> {
        let mut chain = Vec::new();
        let mut current = Some(name.to_string());
        while let Some(n) = current {
            let archive = self.read_archive(&n)?;
            current = archive.header.parent.clone();
            chain.push(archive);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Verify checksums of every entry in `name`'s full dependency
    /// chain.
    pub fn verify(&self, name: &str) -> StoreResult<VerifyReport> {
        let chain = self.resolve_chain(name)?;
        let mut report = VerifyReport::default();
        for archive in &chain {
            for entry in &archive.entries {
                report.total_entries += 1;
                if !entry.is_valid() {
                    report.corrupt_entries.push(entry.metadata.key.as_str().to_string());
                }
            }
        }
        Ok(report)
    }

    /// Replay `name`'s full dependency chain (oldest first, so later
    /// incrementals override earlier full-backup entries for the same
    /// key) and hand each valid entry to `apply`. Corrupt entries are
    /// skipped and reported rather than applied.
    pub fn restore(
        &self,
        name: &str,
        mut apply: impl FnMut(Metadata, Vec<u8>) -> StoreResult<()>,
    ) -> StoreResult<VerifyReport> {
        let chain = self.resolve_chain(name)?;
        let mut report = VerifyReport::default();
        for archive in &chain {
            for entry in &archive.entries {
                report.total_entries += 1;
                if !entry.is_valid() {
                    report.corrupt_entries.push(entry.metadata.key.as_str().to_string());
                    continue;
                }
                apply(entry.metadata.clone(), entry.value.clone())?;
            }
        }
        Ok(report)
    }

    /// Delete archives older than `keep_days` (by header `created_at`
    /// against `now`), but always keep at least `keep_count` most
    /// recent archives regardless of age, and never delete an archive
    /// that a surviving archive depends on as a parent.
    pub fn cleanup_old_backups(&self, now: i64, keep_days: i64, keep_count: usize) -> StoreResult<Vec<String>> {
        let mut candidates: Vec<(String, Archive)> = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("corebackup") {
                continue;
            }
            let name = path.file_stem().unwrap().to_string_lossy().to_string();
            let archive = self.read_archive(&name)?;
            candidates.push((name, archive));
        }
        candidates.sort_by_key(|(_, a)| a.header.created_at);
        let protected: std::collections::HashSet<String> = candidates
            .iter()
            .filter_map(|(_, a)| a.header.parent.clone())
            .collect();

        let cutoff = now.saturating_sub(keep_days.saturating_mul(86_400));
        let keep_from = candidates.len().saturating_sub(keep_count);
        let mut removed = Vec::new();
        for (idx, (name, archive)) in candidates.iter().enumerate() {
            let within_keep_count = idx >= keep_from;
            let recent_enough = archive.header.created_at >= cutoff;
            if within_keep_count || recent_enough || protected.contains(name) {
                continue;
            }
            std::fs::remove_file(self.archive_path(name))?;
            removed.push(name.clone());
        }
        Ok(removed)
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}
