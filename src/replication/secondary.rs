//! Secondary side of replication: connects to a primary, requests
//! everything since the last applied sequence, applies each operation
//! through a caller-supplied callback, and reconnects with exponential
//! backoff plus jitter if the link drops.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{StoreError, StoreResult};
use crate::events::{default_sink, Event, EventSink, Level};
use crate::replication::{OperationRecord, ReplicatedOp, ReplicationMessage};
use crate::wire;

/// Applies replicated operations to local state; implemented by
/// [`crate::store::Store`] for a live secondary.
pub trait ReplicaApply: Send + Sync {
    fn apply(&self, op: &ReplicatedOp) -> StoreResult<()>;
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Drives a single secondary connection to one primary.
pub struct ReplicationSecondary {
    endpoint: String,
    last_applied_seq: AtomicU64,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
}

impl ReplicationSecondary {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            last_applied_seq: AtomicU64::new(0),
            stop: Arc::new(AtomicBool::new(false)),
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn last_applied_seq(&self) -> u64 {
        self.last_applied_seq.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Run the connect-sync-apply loop on the current thread until
    /// [`Self::stop`] is called. Intended to be spawned on a dedicated
    /// background thread by the caller.
    pub fn run(&self, apply: &dyn ReplicaApply) {
        let mut backoff = INITIAL_BACKOFF;
        while !self.stop.load(Ordering::Relaxed) {
            match self.connect_and_sync(apply) {
                Ok(()) => backoff = INITIAL_BACKOFF,
                Err(e) => {
                    self.sink.emit(
                        Event::new(Level::Warn, "replication_secondary", "connect_and_sync")
                            .failed()
                            .attr("error", e.to_string())
                            .attr("retry_in_ms", backoff.as_millis()),
                    );
                    std::thread::sleep(jittered(backoff));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn connect_and_sync(&self, apply: &dyn ReplicaApply) -> StoreResult<()> {
        let stream = TcpStream::connect(&self.endpoint)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        while !self.stop.load(Ordering::Relaxed) {
            let request = ReplicationMessage::SyncRequest { from_seq: self.last_applied_seq() };
            self.send(&stream, &request)?;
            let response = self.recv(&stream)?;
            match response {
                ReplicationMessage::SyncResponse { ops } => self.apply_ops(apply, &ops)?,
                ReplicationMessage::SyncOutOfRange { earliest_available } => {
                    return Err(StoreError::InvalidState(format!(
                        "fell behind primary's retained window; earliest available seq is {earliest_available}"
                    )));
                }
                ReplicationMessage::Heartbeat { head_seq } => {
                    if head_seq > self.last_applied_seq() {
                        // There's more to fetch; loop back around
                        // immediately instead of waiting for the next
                        // heartbeat.
                        continue;
                    }
                }
                ReplicationMessage::SyncRequest { .. } => {
                    return Err(StoreError::InvalidState("unexpected SyncRequest from primary".into()));
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }

    fn apply_ops(&self, apply: &dyn ReplicaApply, ops: &[OperationRecord]) -> StoreResult<()> {
        for record in ops {
            if !record.is_valid() {
                return Err(StoreError::Corruption(format!(
                    "checksum mismatch for replicated op at seq {}",
                    record.seq
                )));
            }
            if record.seq <= self.last_applied_seq() {
                continue;
            }
            apply.apply(&record.op)?;
            self.last_applied_seq.store(record.seq, Ordering::Relaxed);
        }
        Ok(())
    }

    fn send(&self, stream: &TcpStream, message: &ReplicationMessage) -> StoreResult<()> {
        let encoded = wire::encode(message)?;
        let mut writer = BufWriter::new(stream);
        wire::write_frame(&mut writer, &encoded)
    }

    fn recv(&self, stream: &TcpStream) -> StoreResult<ReplicationMessage> {
        let mut reader = BufReader::new(stream);
        let bytes = wire::read_frame(&mut reader)?;
        wire::decode(&bytes)
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4 + 1);
    base + Duration::from_millis(jitter_ms)
}
