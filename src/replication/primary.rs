//! Primary side of replication: accepts secondary connections, streams
//! them the op log since their last acknowledged sequence, and keeps
//! pushing new operations as they're broadcast.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{StoreError, StoreResult};
use crate::replication::{OpRingBuffer, OperationRecord, ReplicatedOp, ReplicationMessage};
use crate::wire;

struct ReplicaHandle {
    last_acked_seq: AtomicU64,
}

/// Owns the op log and accepts secondary connections.
pub struct ReplicationPrimary {
    ring: Mutex<OpRingBuffer>,
    replicas: DashMap<u64, Arc<ReplicaHandle>>,
    next_replica_id: AtomicU64,
    stop: Arc<AtomicBool>,
}

impl ReplicationPrimary {
    pub fn new(max_op_log: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(OpRingBuffer::new(max_op_log)),
            replicas: DashMap::new(),
            next_replica_id: AtomicU64::new(1),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Record an operation so it is available to secondaries that
    /// connect or poll afterward.
    pub fn broadcast(&self, op: ReplicatedOp) -> OperationRecord {
        self.ring.lock().unwrap().push(op)
    }

    pub fn head_seq(&self) -> u64 {
        self.ring.lock().unwrap().head_seq()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// How far behind the primary's head each connected replica's last
    /// acknowledged sync response was, keyed by replica id.
    pub fn replica_lag(&self) -> Vec<(u64, u64)> {
        let head = self.head_seq();
        self.replicas
            .iter()
            .map(|entry| (*entry.key(), head.saturating_sub(entry.value().last_acked_seq.load(Ordering::Relaxed))))
            .collect()
    }

    /// Bind and serve secondary connections on a background thread
    /// until [`Self::stop`] is called. Returns the bound address
    /// alongside the thread handle so callers using `:0` for an
    /// ephemeral port can learn what was actually bound.
    pub fn serve(
        self: &Arc<Self>,
        addr: &str,
        heartbeat: Duration,
    ) -> std::io::Result<(std::net::SocketAddr, std::thread::JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let bound_addr = listener.local_addr()?;
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while !this.stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let this = Arc::clone(&this);
                        std::thread::spawn(move || {
                            let _ = this.handle_secondary(stream, heartbeat);
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Err(_) => break,
                }
            }
        });
        Ok((bound_addr, handle))
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn handle_secondary(&self, stream: TcpStream, heartbeat: Duration) -> StoreResult<()> {
        let replica_id = self.next_replica_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ReplicaHandle { last_acked_seq: AtomicU64::new(0) });
        self.replicas.insert(replica_id, Arc::clone(&handle));
        stream.set_read_timeout(Some(heartbeat))?;
        let result = self.serve_loop(&stream, &handle);
        self.replicas.remove(&replica_id);
        result
    }

    fn serve_loop(&self, stream: &TcpStream, handle: &ReplicaHandle) -> StoreResult<()> {
        loop {
            let request = match read_frame_with_timeout(stream) {
                FrameOutcome::Frame(bytes) => bytes,
                FrameOutcome::TimedOut => {
                    // No request pending within the heartbeat window;
                    // tell the secondary where we are so an idle link
                    // still reveals whether it has fallen behind.
                    let msg = ReplicationMessage::Heartbeat { head_seq: self.head_seq() };
                    self.send(stream, &msg)?;
                    continue;
                }
                FrameOutcome::Err(e) => return Err(e),
            };
            let message: ReplicationMessage = wire::decode(&request)?;
            match message {
                ReplicationMessage::SyncRequest { from_seq } => {
                    let response = {
                        let ring = self.ring.lock().unwrap();
                        match ring.since(from_seq) {
                            Some(ops) => ReplicationMessage::SyncResponse { ops },
                            None => ReplicationMessage::SyncOutOfRange {
                                earliest_available: ring.earliest_seq(),
                            },
                        }
                    };
                    if let ReplicationMessage::SyncResponse { ops } = &response {
                        if let Some(last) = ops.last() {
                            handle.last_acked_seq.store(last.seq, Ordering::Relaxed);
                        }
                    }
                    self.send(stream, &response)?;
                }
                other => {
                    return Err(StoreError::InvalidState(format!(
                        "unexpected message from secondary: {other:?}"
                    )));
                }
            }
        }
    }

    fn send(&self, stream: &TcpStream, message: &ReplicationMessage) -> StoreResult<()> {
        let encoded = wire::encode(message)?;
        let mut writer = BufWriter::new(stream);
        wire::write_frame(&mut writer, &encoded)
    }
}

enum FrameOutcome {
    Frame(Vec<u8>),
    TimedOut,
    Err(StoreError),
}

/// Read one length-prefixed frame, distinguishing a read timeout (the
/// stream has `set_read_timeout` applied) from a genuine I/O error so
/// the caller can send a heartbeat instead of tearing down the
/// connection.
fn read_frame_with_timeout(stream: &TcpStream) -> FrameOutcome {
    let mut reader = BufReader::new(stream);
    match wire::read_frame(&mut reader) {
        Ok(bytes) => FrameOutcome::Frame(bytes),
        Err(StoreError::BackendIO(msg)) => {
            if msg.contains("would block") || msg.contains("timed out") {
                FrameOutcome::TimedOut
            } else {
                FrameOutcome::Err(StoreError::BackendIO(msg))
            }
        }
        Err(e) => FrameOutcome::Err(e),
    }
}
