//! # Connection Hub
//!
//! The single owned service object holding every piece of real-time state: the room
//! registry, the table of live connections and the rejected-code cache.
//!
//! ## Concurrency Model:
//! `SharedHub` wraps the hub in one `Arc<Mutex<..>>`. Each event (open, join, message,
//! close, heartbeat tick) locks it once, mutates, pushes outbound commands into the
//! connections' mailboxes and unlocks. Pushing never blocks, and the lock is never
//! held across an `.await`, so events are applied one at a time.
//!
//! The join handshake lives in `lifecycle`, liveness in `heartbeat` and message
//! delivery in `router`; each adds its own `impl Hub` block.

use crate::config::RoomsConfig;
use crate::protocol::ServerMessage;
use crate::rooms::{registry, DurableRooms, RejectedCodes, RoomError, RoomRegistry};
use actix::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of one real-time connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Student,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Student => write!(f, "student"),
        }
    }
}

/// Hub-side connection lifecycle: `AwaitingRoomJoin → Joined → Closed`.
///
/// Before registration the connection only exists on the transport side. A rejected
/// join goes straight from `AwaitingRoomJoin` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRoomJoin,
    Joined,
    Closed,
}

/// Commands pushed from the hub into a connection's mailbox.
#[derive(Debug, Clone, PartialEq, Message)]
#[rtype(result = "()")]
pub enum ClientCommand {
    Send(ServerMessage),
    /// Send a liveness probe
    Probe,
    /// Drop the transport without a close handshake
    Terminate,
    /// Flush, send a close frame with `reason`, then stop
    Close { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError(pub String);

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

/// Non-blocking mailbox of one connection.
pub trait ClientSink: Send {
    fn push(&self, command: ClientCommand) -> Result<(), DeliveryError>;
}

pub(crate) struct ConnectionEntry {
    pub(crate) role: Role,
    /// False while the role is only the default of a bare connection; the first
    /// join request may still change it.
    pub(crate) role_fixed: bool,
    pub(crate) room_code: Option<String>,
    pub(crate) target_languages: Vec<String>,
    pub(crate) alive: bool,
    /// When the outstanding liveness probe was sent
    pub(crate) probe_sent: Option<Instant>,
    pub(crate) state: ConnectionState,
    pub(crate) sink: Box<dyn ClientSink>,
}

/// Room retention and capacity rules.
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    pub max_students: usize,
    pub keep_room_on_host_leave: bool,
    pub close_empty_rooms: bool,
    pub host_probe_grace: Duration,
}

impl RoomPolicy {
    /// A host counts as unresponsive once a probe has gone unanswered for a full
    /// heartbeat interval.
    pub fn new(config: &RoomsConfig, heartbeat_interval: Duration) -> Self {
        Self {
            max_students: config.max_students,
            keep_room_on_host_leave: config.keep_room_on_host_leave,
            close_empty_rooms: config.close_empty_rooms,
            host_probe_grace: heartbeat_interval,
        }
    }
}

/// Point-in-time counters for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub rooms: usize,
    pub connections: usize,
    pub hosts: usize,
    pub students: usize,
    pub unjoined: usize,
    pub rejected_codes: usize,
}

pub struct Hub {
    pub(crate) registry: RoomRegistry,
    pub(crate) connections: HashMap<ConnectionId, ConnectionEntry>,
    pub(crate) rejected: RejectedCodes,
    pub(crate) durable: DurableRooms,
    pub(crate) policy: RoomPolicy,
}

impl Hub {
    pub fn new(policy: RoomPolicy, transcript_limit: usize, rejected_capacity: usize, durable: DurableRooms) -> Self {
        Self {
            registry: RoomRegistry::new(transcript_limit),
            connections: HashMap::new(),
            rejected: RejectedCodes::new(rejected_capacity),
            durable,
            policy,
        }
    }

    /// Start tracking a freshly opened connection. Without a requested role it is a
    /// host until its first join says otherwise.
    pub fn register(
        &mut self,
        id: ConnectionId,
        requested_role: Option<Role>,
        target_languages: Vec<String>,
        sink: Box<dyn ClientSink>,
    ) {
        let role = requested_role.unwrap_or(Role::Host);
        debug!(conn_id = %id, role = %role, "Connection registered");
        self.connections.insert(
            id,
            ConnectionEntry {
                role,
                role_fixed: requested_role.is_some(),
                room_code: None,
                target_languages,
                alive: true,
                probe_sent: None,
                state: ConnectionState::AwaitingRoomJoin,
                sink,
            },
        );
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|c| c.state)
    }

    pub fn connection_room(&self, id: ConnectionId) -> Option<&str> {
        self.connections.get(&id).and_then(|c| c.room_code.as_deref())
    }

    pub fn role(&self, id: ConnectionId) -> Option<Role> {
        self.connections.get(&id).map(|c| c.role)
    }

    pub fn set_languages(&mut self, id: ConnectionId, languages: Vec<String>) {
        if let Some(entry) = self.connections.get_mut(&id) {
            debug!(conn_id = %id, languages = ?languages, "Target languages updated");
            entry.target_languages = languages;
        }
    }

    /// Register a room with no participants, e.g. one reserved over HTTP.
    pub fn create_room(&mut self, code: &str) -> Result<(), RoomError> {
        let snapshot = self.registry.create_room(code)?.snapshot();
        self.rejected.remove(code);
        self.durable.save_detached(code.to_string(), snapshot);
        Ok(())
    }

    pub fn room_exists(&self, code: &str) -> bool {
        self.registry.contains(code)
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn reject_code(&mut self, code: &str) {
        self.rejected.insert(code);
    }

    pub fn is_code_rejected(&self, code: &str) -> bool {
        self.rejected.contains(code)
    }

    pub fn sweep_rejected_codes(&mut self) -> usize {
        self.rejected.sweep()
    }

    /// Push `message` to one connection. Failures are logged and reported, never raised.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        self.push(id, ClientCommand::Send(message))
    }

    pub fn send_error(&self, id: ConnectionId, message: impl Into<String>) -> bool {
        self.send_to(id, ServerMessage::error(message))
    }

    pub(crate) fn push(&self, id: ConnectionId, command: ClientCommand) -> bool {
        let Some(entry) = self.connections.get(&id) else {
            debug!(conn_id = %id, "Dropping command for unknown connection");
            return false;
        };
        match entry.sink.push(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "Failed to deliver to connection");
                false
            }
        }
    }

    /// Persist the current snapshot of `code` without waiting for the store.
    pub(crate) fn persist(&self, code: &str) {
        if let Some(room) = self.registry.get(code) {
            self.durable.save_detached(code.to_string(), room.snapshot());
        }
    }

    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            rooms: self.registry.len(),
            connections: self.connections.len(),
            rejected_codes: self.rejected.len(),
            ..HubStats::default()
        };
        for entry in self.connections.values() {
            match (entry.state, entry.role) {
                (ConnectionState::Joined, Role::Host) => stats.hosts += 1,
                (ConnectionState::Joined, Role::Student) => stats.students += 1,
                _ => stats.unjoined += 1,
            }
        }
        stats
    }
}

/// Cloneable handle to the hub shared by HTTP handlers, sessions and timers.
#[derive(Clone)]
pub struct SharedHub(Arc<Mutex<Hub>>);

impl SharedHub {
    pub fn new(hub: Hub) -> Self {
        Self(Arc::new(Mutex::new(hub)))
    }

    /// Lock the hub. A panic while holding the lock cannot leave a half-applied
    /// event behind in a way later events could not cope with, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Hub> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a code unused in-process and in the durable store, and register an
    /// empty room under it.
    pub async fn generate_room_code(&self, durable: &DurableRooms, attempts: u32) -> Result<String, RoomError> {
        registry::generate_unique_code(
            attempts,
            durable,
            |code| self.lock().room_exists(code),
            |code| self.lock().create_room(code).is_ok(),
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rooms::MemoryRoomStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sink that records every command; can be switched to fail.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        log: Arc<Mutex<Vec<ClientCommand>>>,
        failing: Arc<AtomicBool>,
    }

    impl RecordingSink {
        pub(crate) fn commands(&self) -> Vec<ClientCommand> {
            self.log.lock().unwrap().clone()
        }

        pub(crate) fn messages(&self) -> Vec<ServerMessage> {
            self.commands()
                .into_iter()
                .filter_map(|c| match c {
                    ClientCommand::Send(m) => Some(m),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn clear(&self) {
            self.log.lock().unwrap().clear();
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub(crate) fn was_closed(&self) -> bool {
            self.commands().iter().any(|c| matches!(c, ClientCommand::Close { .. }))
        }

        pub(crate) fn was_terminated(&self) -> bool {
            self.commands().iter().any(|c| matches!(c, ClientCommand::Terminate))
        }
    }

    impl ClientSink for RecordingSink {
        fn push(&self, command: ClientCommand) -> Result<(), DeliveryError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeliveryError("connection closing".to_string()));
            }
            self.log.lock().unwrap().push(command);
            Ok(())
        }
    }

    pub(crate) fn test_policy() -> RoomPolicy {
        RoomPolicy {
            max_students: 200,
            keep_room_on_host_leave: true,
            close_empty_rooms: false,
            host_probe_grace: Duration::from_secs(30),
        }
    }

    pub(crate) fn test_hub_with(policy: RoomPolicy, durable: DurableRooms) -> SharedHub {
        SharedHub::new(Hub::new(policy, 50, 1000, durable))
    }

    pub(crate) fn test_hub() -> SharedHub {
        test_hub_with(test_policy(), DurableRooms::disabled())
    }

    pub(crate) fn memory_durable() -> (Arc<MemoryRoomStore>, DurableRooms) {
        let store = Arc::new(MemoryRoomStore::new());
        let durable = DurableRooms::new(store.clone(), Duration::from_secs(60));
        (store, durable)
    }

    fn register_with(hub: &SharedHub, role: Option<Role>, languages: &[&str]) -> (ConnectionId, RecordingSink) {
        let id = ConnectionId::new();
        let sink = RecordingSink::default();
        hub.lock().register(
            id,
            role,
            languages.iter().map(|l| l.to_string()).collect(),
            Box::new(sink.clone()),
        );
        (id, sink)
    }

    /// Register a connection and return its id with the sink observing it.
    pub(crate) fn connect(hub: &SharedHub, role: Role, languages: &[&str]) -> (ConnectionId, RecordingSink) {
        register_with(hub, Some(role), languages)
    }

    /// Register a connection opened without any join parameters.
    pub(crate) fn connect_bare(hub: &SharedHub) -> (ConnectionId, RecordingSink) {
        register_with(hub, None, &[])
    }

    #[test]
    fn test_register_tracks_awaiting_connection() {
        let hub = test_hub();
        let (id, _sink) = connect(&hub, Role::Student, &["Spanish"]);

        let guard = hub.lock();
        assert_eq!(guard.connection_state(id), Some(ConnectionState::AwaitingRoomJoin));
        assert_eq!(guard.role(id), Some(Role::Student));
        assert_eq!(guard.stats().unjoined, 1);
    }

    #[test]
    fn test_bare_connection_defaults_to_provisional_host() {
        let hub = test_hub();
        let (id, _sink) = connect_bare(&hub);

        let guard = hub.lock();
        assert_eq!(guard.role(id), Some(Role::Host));
        assert!(!guard.connections[&id].role_fixed);
    }

    #[test]
    fn test_send_to_reports_failures() {
        let hub = test_hub();
        let (id, sink) = connect(&hub, Role::Host, &[]);

        assert!(hub.lock().send_to(id, ServerMessage::info("hi")));
        sink.set_failing(true);
        assert!(!hub.lock().send_to(id, ServerMessage::info("again")));
        assert!(!hub.lock().send_to(ConnectionId::new(), ServerMessage::info("nobody")));
        assert_eq!(sink.messages(), vec![ServerMessage::info("hi")]);
    }

    #[test]
    fn test_create_room_clears_rejected_code() {
        let hub = test_hub();
        hub.lock().reject_code("12345");
        hub.lock().create_room("12345").unwrap();

        let guard = hub.lock();
        assert!(!guard.is_code_rejected("12345"));
        assert!(guard.room_exists("12345"));
    }

    #[tokio::test]
    async fn test_generate_room_code_registers_room() {
        let (store, durable) = memory_durable();
        let hub = test_hub_with(test_policy(), durable.clone());

        let code = hub.generate_room_code(&durable, 5).await.unwrap();
        assert!(hub.lock().room_exists(&code));

        // The reservation is shadowed to the store in the background.
        durable.flush().await;
        assert_eq!(store.writes(), 1);
        assert!(durable.exists(&code).await);
    }
}
