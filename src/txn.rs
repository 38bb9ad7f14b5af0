//! Transaction manager: short-lived, single-writer
//! transactions that buffer mutations against a snapshot and apply them
//! atomically on commit.
//!
//! Transactions are scoped to one [`crate::store::Store`] and do not
//! nest.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::record::{Scope, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

/// A single buffered mutation, applied in order on commit.
#[derive(Debug, Clone)]
pub enum Operation {
    Set { key: String, value: Vec<u8>, tags: BTreeSet<Tag>, ttl_seconds: Option<u64> },
    Delete { key: String },
}

/// Snapshot of a key's state as of transaction start, captured lazily
/// the first time the transaction touches that key, so that a rollback
/// can restore exactly what existed before.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Present { value: Vec<u8>, tags: BTreeSet<Tag>, ttl_seconds: Option<u64> },
    Absent,
}

/// One in-flight transaction: its snapshot set and queued operations.
pub struct Transaction {
    scope: Scope,
    state: TxnState,
    snapshots: HashMap<String, Snapshot>,
    /// Keys in the order their snapshot was first captured, so rollback
    /// can restore them in reverse insertion order.
    snapshot_order: Vec<String>,
    operations: Vec<Operation>,
}

impl Transaction {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            state: TxnState::Active,
            snapshots: HashMap::new(),
            snapshot_order: Vec::new(),
            operations: Vec::new(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Record the pre-transaction state of `key` the first time it is
    /// touched; later touches are no-ops so the snapshot always reflects
    /// what existed before the transaction began.
    pub fn remember(&mut self, key: &str, snapshot: impl FnOnce() -> Snapshot) {
        if !self.snapshots.contains_key(key) {
            self.snapshots.insert(key.to_string(), snapshot());
            self.snapshot_order.push(key.to_string());
        }
    }

    pub fn stage_set(&mut self, key: String, value: Vec<u8>, tags: BTreeSet<Tag>, ttl_seconds: Option<u64>) {
        self.operations.push(Operation::Set { key, value, tags, ttl_seconds });
    }

    pub fn stage_delete(&mut self, key: String) {
        self.operations.push(Operation::Delete { key });
    }

    pub fn snapshots(&self) -> &HashMap<String, Snapshot> {
        &self.snapshots
    }

    /// Keys in reverse insertion order, for rollback restoration.
    pub fn snapshot_order_reversed(&self) -> impl Iterator<Item = &str> {
        self.snapshot_order.iter().rev().map(String::as_str)
    }
}

/// Owns at most one active transaction per store handle.
#[derive(Default)]
pub struct TransactionManager {
    current: Mutex<Option<Transaction>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, scope: Scope) -> StoreResult<()> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(StoreError::InvalidState(
                "a transaction is already active on this store handle".into(),
            ));
        }
        *current = Some(Transaction::new(scope));
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.current.lock().as_ref().map(Transaction::state), Some(TxnState::Active))
    }

    /// Run `f` with mutable access to the active transaction, returning
    /// [`StoreError::InvalidState`] if none is active.
    pub fn with_active<R>(&self, f: impl FnOnce(&mut Transaction) -> StoreResult<R>) -> StoreResult<R> {
        let mut current = self.current.lock();
        match current.as_mut() {
            Some(txn) if txn.state == TxnState::Active => f(txn),
            _ => Err(StoreError::InvalidState("no active transaction".into())),
        }
    }

    /// Take the active transaction's queued operations for the caller
    /// to apply, marking the transaction committed. Returns
    /// [`StoreError::InvalidState`] if there is nothing active, or
    /// propagates `apply`'s error after marking the transaction rolled
    /// back.
    pub fn commit(&self, apply: impl FnOnce(&Transaction) -> StoreResult<()>) -> StoreResult<()> {
        let mut current = self.current.lock();
        let txn = match current.as_mut() {
            Some(txn) if txn.state == TxnState::Active => txn,
            _ => return Err(StoreError::InvalidState("no active transaction".into())),
        };
        match apply(txn) {
            Ok(()) => {
                txn.state = TxnState::Committed;
                *current = None;
                Ok(())
            }
            Err(e) => {
                txn.state = TxnState::RolledBack;
                *current = None;
                Err(e)
            }
        }
    }

    /// Abandon the active transaction without applying anything.
    pub fn rollback(&self) -> StoreResult<()> {
        let mut current = self.current.lock();
        match current.as_mut() {
            Some(txn) if txn.state == TxnState::Active => {
                txn.state = TxnState::RolledBack;
                *current = None;
                Ok(())
            }
            _ => Err(StoreError::InvalidState("no active transaction".into())),
        }
    }
}
