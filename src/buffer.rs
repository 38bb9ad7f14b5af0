//! In-memory write buffer for buffering backends.
//!
//! Writes against a backend whose `capabilities().write_strategy` is
//! [`crate::backend::WriteStrategy::Buffered`] land here first. The
//! buffer accumulates bytes until a caller-driven flush (explicit call,
//! high-water mark, or the background synchronizer's interval) pushes
//! them through to the backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::record::{Scope, StoreKey};

fn buffer_key(scope: &Scope, key: &StoreKey) -> String {
    format!("{}\0{}\0{}", scope.db, scope.namespace, key.as_str())
}

/// An entry awaiting flush: the encoded (compressed) bytes plus the
/// backend-relative path they should be written to. Carries its own
/// scope/key so a caller that fails to persist it can re-stage it
/// without reconstructing that addressing from the path.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub scope: Scope,
    pub key: StoreKey,
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Accumulates writes until flushed, tracking total buffered bytes so
/// the store can trigger a flush once `buffer_size_mb` is exceeded.
pub struct WriteBuffer {
    entries: Mutex<HashMap<String, PendingWrite>>,
    bytes: AtomicUsize,
    high_water_mark: usize,
}

impl WriteBuffer {
    pub fn new(high_water_mark_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            bytes: AtomicUsize::new(0),
            high_water_mark: high_water_mark_bytes,
        }
    }

    /// Stage a write, replacing any previous pending write for the same
    /// key. Returns `true` if the buffer is now at or above its
    /// high-water mark and a flush should be triggered.
    pub fn stage(&self, scope: &Scope, key: &StoreKey, path: String, bytes: Vec<u8>) -> bool {
        let mut entries = self.entries.lock();
        let k = buffer_key(scope, key);
        let new_len = bytes.len();
        let entry = PendingWrite { scope: scope.clone(), key: key.clone(), path, bytes };
        if let Some(previous) = entries.insert(k, entry) {
            self.bytes.fetch_sub(previous.bytes.len(), Ordering::Relaxed);
        }
        self.bytes.fetch_add(new_len, Ordering::Relaxed);
        self.bytes.load(Ordering::Relaxed) >= self.high_water_mark
    }

    /// Remove a pending write without flushing it (used when a key is
    /// deleted before its buffered write ever reached the backend).
    pub fn discard(&self, scope: &Scope, key: &StoreKey) {
        let mut entries = self.entries.lock();
        if let Some(removed) = entries.remove(&buffer_key(scope, key)) {
            self.bytes.fetch_sub(removed.bytes.len(), Ordering::Relaxed);
        }
    }

    /// Look up a pending write by key, for read-your-writes consistency
    /// before a flush has happened.
    pub fn peek(&self, scope: &Scope, key: &StoreKey) -> Option<PendingWrite> {
        self.entries.lock().get(&buffer_key(scope, key)).cloned()
    }

    /// Atomically take every pending write, clearing the buffer. The
    /// caller is responsible for persisting them; on failure the caller
    /// should re-stage whichever entries did not make it through.
    pub fn drain(&self) -> Vec<PendingWrite> {
        let mut entries = self.entries.lock();
        self.bytes.store(0, Ordering::Relaxed);
        entries.drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_then_peek_returns_pending_bytes() {
        let buffer = WriteBuffer::new(1024);
        let scope = Scope::new("db", "ns");
        let key = StoreKey::new("k").unwrap();
        buffer.stage(&scope, &key, "path".into(), vec![1, 2, 3]);
        assert_eq!(buffer.peek(&scope, &key).unwrap().bytes, vec![1, 2, 3]);
        assert_eq!(buffer.byte_size(), 3);
    }

    #[test]
    fn staging_same_key_replaces_and_adjusts_byte_count() {
        let buffer = WriteBuffer::new(1024);
        let scope = Scope::new("db", "ns");
        let key = StoreKey::new("k").unwrap();
        buffer.stage(&scope, &key, "path".into(), vec![0; 10]);
        buffer.stage(&scope, &key, "path".into(), vec![0; 3]);
        assert_eq!(buffer.byte_size(), 3);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn high_water_mark_signals_flush() {
        let buffer = WriteBuffer::new(5);
        let scope = Scope::new("db", "ns");
        let key = StoreKey::new("k").unwrap();
        let should_flush = buffer.stage(&scope, &key, "path".into(), vec![0; 10]);
        assert!(should_flush);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = WriteBuffer::new(1024);
        let scope = Scope::new("db", "ns");
        let key = StoreKey::new("k").unwrap();
        buffer.stage(&scope, &key, "path".into(), vec![1, 2, 3]);
        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);
    }

    #[test]
    fn discard_removes_without_returning() {
        let buffer = WriteBuffer::new(1024);
        let scope = Scope::new("db", "ns");
        let key = StoreKey::new("k").unwrap();
        buffer.stage(&scope, &key, "path".into(), vec![1, 2, 3]);
        buffer.discard(&scope, &key);
        assert!(buffer.peek(&scope, &key).is_none());
        assert_eq!(buffer.byte_size(), 0);
    }
}
