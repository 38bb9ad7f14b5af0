//! Networked KV storage backend.
//!
//! The backend is a TCP client speaking a small length-prefixed
//! `bincode` request/response protocol (see [`crate::wire`]) against a
//! peer that holds data and metadata natively, including native TTL.
//! [`NetworkedKvServer`] is a reference server implementation used by
//! this crate's own tests and available to applications that want to
//! run a sibling process rather than embed the filesystem backend.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{BackendCapabilities, ListPage, NativeMetadataBackend, StorageBackend, WriteStrategy};
use crate::error::{StoreError, StoreResult};
use crate::record::{Metadata, Scope};
use crate::wire;

/// Hard ceiling the networked backend enforces on value size: 512 MiB.
pub const MAX_VALUE_SIZE_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
enum Request {
    Write { path: String, bytes: Vec<u8> },
    Read { path: String },
    Delete { path: String },
    Exists { path: String },
    Size { path: String },
    List { db: String, namespace: String, cursor: Option<String>, batch_size: usize },
    SetMetadata(Metadata),
    GetMetadata { db: String, namespace: String, key: String },
    DeleteMetadata { db: String, namespace: String, key: String },
    QueryMetadata { db: String, namespace: String },
    CleanupExpired { db: String, namespace: String, now: i64 },
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
enum Response {
    Ok,
    Bytes(Vec<u8>),
    Bool(bool),
    Size(u64),
    Page { paths: Vec<String>, next_cursor: Option<String> },
    Metadata(Option<Metadata>),
    MetadataList(Vec<Metadata>),
    NotFound,
    TooLarge { actual: u64, limit: u64 },
    Err(String),
}

/// A pool of already-connected sockets to the networked backend's peer,
/// grounded on `TopGunBuild-topgun`'s `dashmap`/connection-bookkeeping
/// style for shared, bounded resources.
struct ConnectionPool {
    host: String,
    port: u16,
    idle: Mutex<Vec<TcpStream>>,
    available: Condvar,
    outstanding: Mutex<usize>,
    max_size: usize,
}

impl ConnectionPool {
    fn new(host: String, port: u16, max_size: usize) -> Self {
        Self {
            host,
            port,
            idle: Mutex::new(Vec::new()),
            available: Condvar::new(),
            outstanding: Mutex::new(0),
            max_size,
        }
    }

    fn checkout(&self, wait: Duration) -> StoreResult<TcpStream> {
        {
            let mut idle = self.idle.lock().unwrap();
            if let Some(stream) = idle.pop() {
                return Ok(stream);
            }
        }
        let mut outstanding = self.outstanding.lock().unwrap();
        let deadline = Instant::now() + wait;
        while *outstanding >= self.max_size {
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Busy);
            }
            let (guard, timeout) = self
                .available
                .wait_timeout(outstanding, deadline - now)
                .unwrap();
            outstanding = guard;
            if timeout.timed_out() && *outstanding >= self.max_size {
                return Err(StoreError::Busy);
            }
        }
        *outstanding += 1;
        drop(outstanding);
        TcpStream::connect((self.host.as_str(), self.port)).map_err(|e| {
            let mut outstanding = self.outstanding.lock().unwrap();
            *outstanding -= 1;
            self.available.notify_one();
            StoreError::BackendIO(format!("connect failed: {e}"))
        })
    }

    fn checkin(&self, stream: TcpStream) {
        self.idle.lock().unwrap().push(stream);
        let mut outstanding = self.outstanding.lock().unwrap();
        *outstanding = outstanding.saturating_sub(1);
        self.available.notify_one();
    }

    fn discard(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        *outstanding = outstanding.saturating_sub(1);
        self.available.notify_one();
    }
}

/// Client backend talking to a [`NetworkedKvServer`] (or any peer
/// implementing the same wire protocol).
pub struct NetworkedBackend {
    pool: ConnectionPool,
    checkout_timeout: Duration,
}

impl NetworkedBackend {
    pub fn connect(host: impl Into<String>, port: u16, pool_size: usize) -> Self {
        Self {
            pool: ConnectionPool::new(host.into(), port, pool_size),
            checkout_timeout: Duration::from_secs(5),
        }
    }

    fn roundtrip(&self, request: &Request) -> StoreResult<Response> {
        let mut stream = self.pool.checkout(self.checkout_timeout)?;
        let payload = wire::encode(request)?;
        let result = (|| -> StoreResult<Response> {
            let mut writer = BufWriter::new(&stream);
            wire::write_frame(&mut writer, &payload)?;
            let mut reader = BufReader::new(&stream);
            let response_bytes = wire::read_frame(&mut reader)?;
            wire::decode(&response_bytes)
        })();
        match result {
            Ok(response) => {
                let clone = stream.try_clone();
                self.pool.checkin(stream);
                drop(clone);
                Ok(response)
            }
            Err(e) => {
                self.pool.discard();
                let _ = stream.shutdown(std::net::Shutdown::Both);
                Err(e)
            }
        }
    }
}

impl StorageBackend for NetworkedBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_buffering: false,
            write_strategy: WriteStrategy::Immediate,
            supports_native_ttl: true,
            supports_metadata: true,
            supports_native_queries: false,
            is_distributed: true,
            supports_compression: true,
            max_value_size_bytes: Some(MAX_VALUE_SIZE_BYTES),
        }
    }

    fn write_data(&self, relative_path: &str, bytes: &[u8]) -> StoreResult<()> {
        if bytes.len() as u64 > MAX_VALUE_SIZE_BYTES {
            return Err(StoreError::ValueTooLarge {
                actual: bytes.len(),
                limit: MAX_VALUE_SIZE_BYTES as usize,
            });
        }
        match self.roundtrip(&Request::Write {
            path: relative_path.to_string(),
            bytes: bytes.to_vec(),
        })? {
            Response::Ok => Ok(()),
            Response::TooLarge { actual, limit } => Err(StoreError::ValueTooLarge {
                actual: actual as usize,
                limit: limit as usize,
            }),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn read_data(&self, relative_path: &str) -> StoreResult<Vec<u8>> {
        match self.roundtrip(&Request::Read {
            path: relative_path.to_string(),
        })? {
            Response::Bytes(bytes) => Ok(bytes),
            Response::NotFound => Err(StoreError::NotFound),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn delete_file(&self, relative_path: &str) -> StoreResult<()> {
        match self.roundtrip(&Request::Delete {
            path: relative_path.to_string(),
        })? {
            Response::Ok => Ok(()),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn file_exists(&self, relative_path: &str) -> StoreResult<bool> {
        match self.roundtrip(&Request::Exists {
            path: relative_path.to_string(),
        })? {
            Response::Bool(b) => Ok(b),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn get_file_size(&self, relative_path: &str) -> StoreResult<u64> {
        match self.roundtrip(&Request::Size {
            path: relative_path.to_string(),
        })? {
            Response::Size(size) => Ok(size),
            Response::NotFound => Err(StoreError::NotFound),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn list_keys(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> StoreResult<ListPage> {
        match self.roundtrip(&Request::List {
            db: scope.db.clone(),
            namespace: scope.namespace.clone(),
            cursor: cursor.map(str::to_string),
            batch_size,
        })? {
            Response::Page { paths, next_cursor } => Ok(ListPage { paths, next_cursor }),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }
}

impl NativeMetadataBackend for NetworkedBackend {
    fn set_metadata(&self, record: &Metadata) -> StoreResult<()> {
        match self.roundtrip(&Request::SetMetadata(record.clone()))? {
            Response::Ok => Ok(()),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn get_metadata(&self, scope: &Scope, key: &str) -> StoreResult<Option<Metadata>> {
        match self.roundtrip(&Request::GetMetadata {
            db: scope.db.clone(),
            namespace: scope.namespace.clone(),
            key: key.to_string(),
        })? {
            Response::Metadata(m) => Ok(m),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn delete_metadata(&self, scope: &Scope, key: &str) -> StoreResult<()> {
        match self.roundtrip(&Request::DeleteMetadata {
            db: scope.db.clone(),
            namespace: scope.namespace.clone(),
            key: key.to_string(),
        })? {
            Response::Ok => Ok(()),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn query_metadata(&self, scope: &Scope) -> StoreResult<Vec<Metadata>> {
        match self.roundtrip(&Request::QueryMetadata {
            db: scope.db.clone(),
            namespace: scope.namespace.clone(),
        })? {
            Response::MetadataList(list) => Ok(list),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }

    fn cleanup_expired(&self, scope: &Scope, now: i64) -> StoreResult<Vec<Metadata>> {
        match self.roundtrip(&Request::CleanupExpired {
            db: scope.db.clone(),
            namespace: scope.namespace.clone(),
            now,
        })? {
            Response::MetadataList(list) => Ok(list),
            Response::Err(msg) => Err(StoreError::BackendIO(msg)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> StoreError {
    StoreError::BackendIO(format!("unexpected response: {response:?}"))
}

/// Reference server for the networked-KV protocol: an in-memory store
/// with native TTL, used by this crate's integration tests and
/// available as a minimal standalone peer.
pub struct NetworkedKvServer {
    listener: TcpListener,
    stop: Arc<AtomicBool>,
}

struct ServerState {
    blobs: HashMap<String, Vec<u8>>,
    metadata: HashMap<(String, String, String), Metadata>,
}

impl NetworkedKvServer {
    pub fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop on a background thread; returns a handle
    /// that stops the server when dropped or when [`Self::stop`] fires.
    pub fn serve(self) -> std::thread::JoinHandle<()> {
        let state = Arc::new(Mutex::new(ServerState {
            blobs: HashMap::new(),
            metadata: HashMap::new(),
        }));
        let stop = Arc::clone(&self.stop);
        let listener = self.listener;
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        std::thread::spawn(move || {
                            let _ = handle_connection(stream, state);
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        })
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }
}

fn handle_connection(stream: TcpStream, state: Arc<Mutex<ServerState>>) -> StoreResult<()> {
    stream.set_nonblocking(false)?;
    loop {
        let mut reader = BufReader::new(&stream);
        let request_bytes = match wire::read_frame(&mut reader) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(()),
        };
        let request: Request = wire::decode(&request_bytes)?;
        let response = handle_request(&state, request);
        let response_bytes = wire::encode(&response)?;
        let mut writer = BufWriter::new(&stream);
        wire::write_frame(&mut writer, &response_bytes)?;
    }
}

fn handle_request(state: &Arc<Mutex<ServerState>>, request: Request) -> Response {
    let mut state = state.lock().unwrap();
    match request {
        Request::Write { path, bytes } => {
            if bytes.len() as u64 > MAX_VALUE_SIZE_BYTES {
                return Response::TooLarge {
                    actual: bytes.len() as u64,
                    limit: MAX_VALUE_SIZE_BYTES,
                };
            }
            state.blobs.insert(path, bytes);
            Response::Ok
        }
        Request::Read { path } => match state.blobs.get(&path) {
            Some(bytes) => Response::Bytes(bytes.clone()),
            None => Response::NotFound,
        },
        Request::Delete { path } => {
            state.blobs.remove(&path);
            Response::Ok
        }
        Request::Exists { path } => Response::Bool(state.blobs.contains_key(&path)),
        Request::Size { path } => match state.blobs.get(&path) {
            Some(bytes) => Response::Size(bytes.len() as u64),
            None => Response::NotFound,
        },
        Request::List { db, namespace: _, cursor, batch_size } => {
            let mut paths: Vec<String> = state
                .blobs
                .keys()
                .filter(|p| p.starts_with(&format!("{db}/")))
                .cloned()
                .collect();
            paths.sort();
            let start = match cursor {
                Some(after) => paths.iter().position(|p| *p == after).map(|i| i + 1).unwrap_or(0),
                None => 0,
            };
            let end = (start + batch_size).min(paths.len());
            let page = paths[start..end].to_vec();
            let next_cursor = if end < paths.len() { page.last().cloned() } else { None };
            Response::Page { paths: page, next_cursor }
        }
        Request::SetMetadata(record) => {
            let key = (record.scope.db.clone(), record.scope.namespace.clone(), record.key.as_str().to_string());
            state.metadata.insert(key, record);
            Response::Ok
        }
        Request::GetMetadata { db, namespace, key } => {
            Response::Metadata(state.metadata.get(&(db, namespace, key)).cloned())
        }
        Request::DeleteMetadata { db, namespace, key } => {
            state.metadata.remove(&(db, namespace, key));
            Response::Ok
        }
        Request::QueryMetadata { db, namespace } => {
            let list = state
                .metadata
                .values()
                .filter(|m| m.scope.db == db && m.scope.namespace == namespace)
                .cloned()
                .collect();
            Response::MetadataList(list)
        }
        Request::CleanupExpired { db, namespace, now } => {
            let expired: Vec<Metadata> = state
                .metadata
                .values()
                .filter(|m| m.scope.db == db && m.scope.namespace == namespace && m.is_expired(now))
                .cloned()
                .collect();
            for m in &expired {
                let key = (m.scope.db.clone(), m.scope.namespace.clone(), m.key.as_str().to_string());
                state.metadata.remove(&key);
                state.blobs.remove(&m.path);
            }
            Response::MetadataList(expired)
        }
    }
}
