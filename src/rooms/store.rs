//! # Durable Room Store
//!
//! Best-effort persistence of room snapshots in an external key-value service.
//!
//! ## Key Pattern:
//! - `{key_prefix}{code}` → JSON `RoomSnapshot`, written with `EX ttl`
//!
//! ## Failure Semantics:
//! Nothing in the live relay depends on this store for correctness. `DurableRooms`
//! gates every call on availability and turns failures into log lines plus a
//! "nothing there" answer, so callers never branch on store health.
//!
//! ## Write Ordering:
//! Background saves and deletes are queued to one writer task per facade and applied
//! in the order they were issued, so a late snapshot can never resurrect a room that
//! was deleted after it.

use super::room::RoomSnapshot;
use crate::tasks::spawn_detached;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    Backend(String),
    Serialization(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Backend(msg) => write!(f, "Store error: {}", msg),
            StoreError::Serialization(msg) => write!(f, "Snapshot serialization error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Key-value backend for room snapshots.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Cheap, non-blocking health flag.
    fn is_available(&self) -> bool;

    async fn exists(&self, code: &str) -> Result<bool, StoreError>;

    async fn load(&self, code: &str) -> Result<Option<RoomSnapshot>, StoreError>;

    async fn save(&self, code: &str, snapshot: &RoomSnapshot, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, code: &str) -> Result<(), StoreError>;
}

/// Store writes issued without waiting for their outcome.
enum WriteOp {
    Save(String, RoomSnapshot),
    Delete(String),
    /// Completed once every earlier write has been applied
    Flush(oneshot::Sender<()>),
}

/// Availability-gated facade over an optional `RoomStore`.
///
/// Cheap to clone; every clone talks to the same backend and the same writer.
#[derive(Clone)]
pub struct DurableRooms {
    store: Option<Arc<dyn RoomStore>>,
    ttl: Duration,
    writer: Arc<OnceLock<mpsc::UnboundedSender<WriteOp>>>,
}

impl DurableRooms {
    pub fn new(store: Arc<dyn RoomStore>, ttl: Duration) -> Self {
        Self {
            store: Some(store),
            ttl,
            writer: Arc::new(OnceLock::new()),
        }
    }

    /// A facade with no backend: every operation is a successful no-op.
    pub fn disabled() -> Self {
        Self {
            store: None,
            ttl: Duration::ZERO,
            writer: Arc::new(OnceLock::new()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available_store().is_some()
    }

    fn available_store(&self) -> Option<&Arc<dyn RoomStore>> {
        self.store.as_ref().filter(|store| store.is_available())
    }

    /// Whether a snapshot for `code` exists. `false` when the store is unavailable.
    pub async fn exists(&self, code: &str) -> bool {
        let Some(store) = self.available_store() else {
            return false;
        };
        match store.exists(code).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(room_code = %code, error = %e, "Durable exists check failed");
                false
            }
        }
    }

    /// Stored snapshot for `code`. `None` when missing or when the store is unavailable.
    pub async fn load(&self, code: &str) -> Option<RoomSnapshot> {
        let store = self.available_store()?;
        match store.load(code).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(room_code = %code, error = %e, "Durable room load failed");
                None
            }
        }
    }

    pub async fn save_snapshot(&self, code: &str, snapshot: &RoomSnapshot) {
        let Some(store) = self.available_store() else {
            return;
        };
        match store.save(code, snapshot, self.ttl).await {
            Ok(()) => debug!(room_code = %code, "Room snapshot persisted"),
            Err(e) => warn!(room_code = %code, error = %e, "Failed to persist room snapshot"),
        }
    }

    pub async fn delete(&self, code: &str) {
        let Some(store) = self.available_store() else {
            return;
        };
        if let Err(e) = store.delete(code).await {
            warn!(room_code = %code, error = %e, "Failed to delete durable room");
        }
    }

    /// Queue `snapshot` for persistence; the caller never waits for the store.
    /// Returns false when the store is unavailable and nothing was queued.
    pub fn save_detached(&self, code: String, snapshot: RoomSnapshot) -> bool {
        self.enqueue(WriteOp::Save(code, snapshot))
    }

    pub fn delete_detached(&self, code: String) -> bool {
        self.enqueue(WriteOp::Delete(code))
    }

    /// Wait until every write queued so far has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.store.is_some() && self.writer().send(WriteOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn enqueue(&self, op: WriteOp) -> bool {
        if self.available_store().is_none() {
            return false;
        }
        if self.writer().send(op).is_err() {
            warn!("Room snapshot writer has stopped, dropping write");
            return false;
        }
        true
    }

    /// Sender of this facade's writer task, started on first use.
    fn writer(&self) -> &mpsc::UnboundedSender<WriteOp> {
        self.writer.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            // The task gets its own writer cell so it does not keep the queue open.
            let durable = DurableRooms {
                store: self.store.clone(),
                ttl: self.ttl,
                writer: Arc::new(OnceLock::new()),
            };
            spawn_detached("room_snapshot_writer", durable.run_writer(rx));
            tx
        })
    }

    async fn run_writer(self, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
        debug!("Room snapshot writer started");
        while let Some(op) = ops.recv().await {
            match op {
                WriteOp::Save(code, snapshot) => self.save_snapshot(&code, &snapshot).await,
                WriteOp::Delete(code) => self.delete(&code).await,
                WriteOp::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Room snapshot writer stopped");
    }
}

/// Redis-backed store.
///
/// `ConnectionManager` is cheap to clone and reconnects on its own; after a
/// connection-class error the store reports itself unavailable for `retry_after`,
/// then lets the next call probe the server again.
pub struct RedisRoomStore {
    connection: ConnectionManager,
    key_prefix: String,
    retry_after: Duration,
    unavailable_since: Mutex<Option<Instant>>,
}

impl RedisRoomStore {
    pub async fn connect(redis_url: &str, key_prefix: &str, retry_after: Duration) -> Result<Self, StoreError> {
        // Note: the URL may carry credentials, never log it.
        let client = redis::Client::open(redis_url).map_err(|e| {
            error!(error = %e, "Failed to open Redis client");
            StoreError::Unavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            StoreError::Unavailable(format!("Failed to connect to Redis: {e}"))
        })?;

        info!(key_prefix = %key_prefix, "Connected to Redis room store");

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            retry_after,
            unavailable_since: Mutex::new(None),
        })
    }

    fn key(&self, code: &str) -> String {
        format!("{}{}", self.key_prefix, code)
    }

    fn track<T>(&self, result: redis::RedisResult<T>, op: &str) -> Result<T, StoreError> {
        let mut since = self.unavailable_since.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(value) => {
                if since.take().is_some() {
                    info!("Redis room store reachable again");
                }
                Ok(value)
            }
            Err(e) if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() => {
                if since.is_none() {
                    warn!(error = %e, op, "Redis room store unreachable, pausing durability");
                }
                *since = Some(Instant::now());
                Err(StoreError::Unavailable(format!("{op}: {e}")))
            }
            Err(e) => Err(StoreError::Backend(format!("{op}: {e}"))),
        }
    }
}

#[async_trait]
impl RoomStore for RedisRoomStore {
    fn is_available(&self) -> bool {
        match *self.unavailable_since.lock().unwrap_or_else(PoisonError::into_inner) {
            None => true,
            Some(since) => since.elapsed() >= self.retry_after,
        }
    }

    async fn exists(&self, code: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<bool> = conn.exists(self.key(code)).await;
        self.track(result, "EXISTS")
    }

    async fn load(&self, code: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<Option<String>> = conn.get(self.key(code)).await;
        match self.track(result, "GET")? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, code: &str, snapshot: &RoomSnapshot, ttl: Duration) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot)?;
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(self.key(code))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        self.track(result, "SET")
    }

    async fn delete(&self, code: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<()> = conn.del(self.key(code)).await;
        self.track(result, "DEL")
    }
}

/// In-process store with TTL, used for local development and tests.
///
/// Availability can be toggled and writes can be held back, which makes the
/// degradation and fire-and-forget paths observable.
#[derive(Default)]
pub struct MemoryRoomStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
    hold_writes: AtomicBool,
    released: Notify,
    writes: AtomicUsize,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Park every subsequent `save` until `release_writes` is called.
    pub fn hold_writes(&self) {
        self.hold_writes.store(true, Ordering::SeqCst);
    }

    pub fn release_writes(&self) {
        self.hold_writes.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    /// Completed writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_entry(&self, code: &str) -> Option<String> {
        let mut entries = self.entries();
        match entries.get(code) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(code);
                None
            }
            Some((raw, _)) => Some(raw.clone()),
            None => None,
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn exists(&self, code: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.live_entry(code).is_some())
    }

    async fn load(&self, code: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        self.check()?;
        match self.live_entry(code) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, code: &str, snapshot: &RoomSnapshot, ttl: Duration) -> Result<(), StoreError> {
        let released = self.released.notified();
        if self.hold_writes.load(Ordering::SeqCst) {
            released.await;
        }
        self.check()?;
        let payload = serde_json::to_string(snapshot)?;
        self.entries()
            .insert(code.to_string(), (payload, Instant::now() + ttl));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, code: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries().remove(code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::room::Room;

    fn durable_with(store: &Arc<MemoryRoomStore>) -> DurableRooms {
        DurableRooms::new(store.clone(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = Arc::new(MemoryRoomStore::new());
        let durable = durable_with(&store);
        let mut room = Room::new("12345", 50);
        room.append_transcript("hello");

        durable.save_snapshot("12345", &room.snapshot()).await;
        assert!(durable.exists("12345").await);
        let loaded = durable.load("12345").await.unwrap();
        assert_eq!(loaded.transcript[0].text, "hello");

        durable.delete("12345").await;
        assert!(!durable.exists("12345").await);
        assert!(durable.load("12345").await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_is_a_noop() {
        let store = Arc::new(MemoryRoomStore::new());
        let durable = durable_with(&store);
        durable.save_snapshot("12345", &Room::new("12345", 50).snapshot()).await;

        store.set_available(false);
        assert!(!durable.is_available());
        assert!(!durable.exists("12345").await);
        assert!(durable.load("12345").await.is_none());
        durable.save_snapshot("54321", &Room::new("54321", 50).snapshot()).await;
        assert!(!durable.save_detached("54321".to_string(), Room::new("54321", 50).snapshot()));

        store.set_available(true);
        assert!(durable.exists("12345").await);
        assert!(!durable.exists("54321").await);
    }

    #[tokio::test]
    async fn test_disabled_facade() {
        let durable = DurableRooms::disabled();
        assert!(!durable.is_available());
        assert!(!durable.exists("12345").await);
        assert!(durable.load("12345").await.is_none());
        durable.delete("12345").await;
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = Arc::new(MemoryRoomStore::new());
        let durable = DurableRooms::new(store.clone(), Duration::from_millis(10));
        durable.save_snapshot("12345", &Room::new("12345", 50).snapshot()).await;
        assert!(durable.exists("12345").await);

        std::thread::sleep(Duration::from_millis(20));
        assert!(!durable.exists("12345").await);
    }

    #[tokio::test]
    async fn test_detached_save_does_not_block_caller() {
        let store = Arc::new(MemoryRoomStore::new());
        let durable = durable_with(&store);
        store.hold_writes();

        assert!(durable.save_detached("12345".to_string(), Room::new("12345", 50).snapshot()));
        tokio::task::yield_now().await;
        assert_eq!(store.writes(), 0);

        store.release_writes();
        durable.flush().await;
        assert_eq!(store.writes(), 1);
        assert!(durable.exists("12345").await);
    }

    #[tokio::test]
    async fn test_detached_writes_apply_in_issue_order() {
        let store = Arc::new(MemoryRoomStore::new());
        let durable = durable_with(&store);
        store.hold_writes();

        let mut room = Room::new("12345", 50);
        room.append_transcript("first");
        assert!(durable.save_detached("12345".to_string(), room.snapshot()));
        assert!(durable.delete_detached("12345".to_string()));
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        store.release_writes();
        durable.flush().await;
        assert!(!durable.exists("12345").await);

        room.append_transcript("second");
        durable.save_detached("54321".to_string(), Room::new("54321", 50).snapshot());
        durable.save_detached("54321".to_string(), room.snapshot());
        durable.flush().await;
        assert_eq!(durable.load("54321").await.unwrap().transcript.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_on_disabled_facade_returns() {
        let durable = DurableRooms::disabled();
        assert!(!durable.delete_detached("12345".to_string()));
        durable.flush().await;
    }
}
