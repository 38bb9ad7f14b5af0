//! Primary/secondary replication: a primary keeps a
//! bounded ring buffer of operations; each secondary pulls from its own
//! last-applied sequence number, catching up via a bulk sync if it
//! falls behind, or being told it has fallen out of the retained
//! window entirely.
//!
//! Wire framing reuses [`crate::wire`]'s length-prefixed `bincode`
//! messages, the same approach as [`crate::backend::networked`].

pub mod primary;
pub mod secondary;

use std::collections::VecDeque;
use std::collections::BTreeSet;

use crate::record::{Scope, Tag};

/// A single mutation as replicated to secondaries.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum ReplicatedOp {
    Set {
        scope: Scope,
        key: String,
        value: Vec<u8>,
        tags: BTreeSet<Tag>,
        ttl_seconds: Option<u64>,
    },
    Delete {
        scope: Scope,
        key: String,
    },
}

/// One entry in the primary's op log: a monotonically increasing
/// sequence number plus the operation and a checksum over its encoded
/// form.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct OperationRecord {
    pub seq: u64,
    pub op: ReplicatedOp,
    pub checksum: [u8; 32],
}

impl OperationRecord {
    pub fn new(seq: u64, op: ReplicatedOp) -> Self {
        let checksum = checksum_of(seq, &op);
        Self { seq, op, checksum }
    }

    pub fn is_valid(&self) -> bool {
        checksum_of(self.seq, &self.op) == self.checksum
    }
}

fn checksum_of(seq: u64, op: &ReplicatedOp) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    if let Ok(encoded) = crate::wire::encode(op) {
        hasher.update(&encoded);
    }
    hasher.finalize().into()
}

/// Messages exchanged between a secondary and a primary.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum ReplicationMessage {
    /// Secondary -> primary: "send me everything after `from_seq`"
    /// (`from_seq` of 0 requests the full currently-retained window).
    SyncRequest { from_seq: u64 },
    /// Primary -> secondary: the requested operations, oldest first.
    SyncResponse { ops: Vec<OperationRecord> },
    /// Primary -> secondary: `from_seq` is older than anything retained;
    /// the secondary must discard its local state and request a full
    /// resync from `earliest_available`.
    SyncOutOfRange { earliest_available: u64 },
    /// Primary -> secondary: liveness ping; carries the primary's
    /// current head sequence so an idle secondary can detect it has
    /// silently fallen behind.
    Heartbeat { head_seq: u64 },
}

/// Bounded FIFO ring of the most recent operations a primary retains
/// for secondaries to catch up from; oldest entries are evicted
/// unconditionally once capacity is reached.
pub struct OpRingBuffer {
    ops: VecDeque<OperationRecord>,
    capacity: usize,
    next_seq: u64,
}

impl OpRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 1,
        }
    }

    /// Append `op`, assigning it the next sequence number, evicting the
    /// oldest entry if the buffer is at capacity.
    pub fn push(&mut self, op: ReplicatedOp) -> OperationRecord {
        let record = OperationRecord::new(self.next_seq, op);
        self.next_seq += 1;
        if self.ops.len() >= self.capacity {
            self.ops.pop_front();
        }
        self.ops.push_back(record.clone());
        record
    }

    /// The oldest sequence number still retained, or the next sequence
    /// to be assigned if the buffer is empty.
    pub fn earliest_seq(&self) -> u64 {
        self.ops.front().map(|r| r.seq).unwrap_or(self.next_seq)
    }

    pub fn head_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Operations strictly after `from_seq`, or `None` if `from_seq` is
    /// older than anything retained (the caller should respond with
    /// [`ReplicationMessage::SyncOutOfRange`]).
    pub fn since(&self, from_seq: u64) -> Option<Vec<OperationRecord>> {
        if from_seq < self.earliest_seq().saturating_sub(1) {
            return None;
        }
        Some(self.ops.iter().filter(|r| r.seq > from_seq).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_op(key: &str) -> ReplicatedOp {
        ReplicatedOp::Set {
            scope: Scope::new("db", "ns"),
            key: key.to_string(),
            value: vec![1, 2, 3],
            tags: BTreeSet::new(),
            ttl_seconds: None,
        }
    }

    #[test]
    fn push_assigns_increasing_sequence_numbers() {
        let mut ring = OpRingBuffer::new(10);
        let r1 = ring.push(sample_op("a"));
        let r2 = ring.push(sample_op("b"));
        assert_eq!(r1.seq, 1);
        assert_eq!(r2.seq, 2);
        assert!(r1.is_valid());
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let mut ring = OpRingBuffer::new(2);
        ring.push(sample_op("a"));
        ring.push(sample_op("b"));
        ring.push(sample_op("c"));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.earliest_seq(), 2);
    }

    #[test]
    fn since_returns_out_of_range_when_too_old() {
        let mut ring = OpRingBuffer::new(2);
        ring.push(sample_op("a"));
        ring.push(sample_op("b"));
        ring.push(sample_op("c"));
        assert!(ring.since(0).is_none());
    }

    #[test]
    fn since_returns_ops_after_given_sequence() {
        let mut ring = OpRingBuffer::new(10);
        ring.push(sample_op("a"));
        ring.push(sample_op("b"));
        ring.push(sample_op("c"));
        let ops = ring.since(1).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].seq, 2);
    }

    #[test]
    fn tampered_checksum_fails_validation() {
        let mut record = OperationRecord::new(1, sample_op("a"));
        record.checksum[0] ^= 0xFF;
        assert!(!record.is_valid());
    }
}
