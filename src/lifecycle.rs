//! # Connection Lifecycle
//!
//! Turns a raw connection into a validated, role-assigned room participant, and tears
//! it down again on close.
//!
//! ## Join Handshake:
//! 1. `begin_join` validates the code, consults the rejected-code cache and decides
//!    whether the durable store must be consulted
//! 2. The durable lookup (if any) runs with the hub unlocked
//! 3. `complete_join` resolves the room (local, hydrated or newly created), enforces the
//!    host and capacity rules, binds the connection and acknowledges it
//!
//! Any rejection sends `room_error` and closes the connection.

use crate::hub::{ClientCommand, ConnectionId, ConnectionState, Hub, Role, SharedHub};
use crate::protocol::ServerMessage;
use crate::rooms::{is_valid_code, DurableRooms, RoomSnapshot};
use std::fmt;
use tracing::{debug, info, warn};

/// Why a join attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    InvalidCode(String),
    RoomNotFound(String),
    HostPresent,
    RoomFull { max_students: usize },
    /// The requested role differs from the one assigned when the connection opened
    RoleMismatch,
    AlreadyJoined,
    /// The connection went away while the join was in flight
    UnknownConnection,
}

impl JoinRejection {
    /// Whether the connection is closed after the rejection is reported.
    pub fn closes_connection(&self) -> bool {
        !matches!(self, JoinRejection::AlreadyJoined | JoinRejection::UnknownConnection)
    }
}

impl fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinRejection::InvalidCode(code) => write!(f, "Invalid room code '{}': expected 5 digits", code),
            JoinRejection::RoomNotFound(code) => write!(f, "Room {} does not exist", code),
            JoinRejection::HostPresent => write!(f, "This room already has an active host"),
            JoinRejection::RoomFull { max_students } => {
                write!(f, "Room is full ({} students maximum)", max_students)
            }
            JoinRejection::RoleMismatch => write!(f, "Requested role does not match this connection"),
            JoinRejection::AlreadyJoined => write!(f, "Already joined a room"),
            JoinRejection::UnknownConnection => write!(f, "Connection is no longer active"),
        }
    }
}

impl std::error::Error for JoinRejection {}

/// Outcome of the synchronous first half of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    /// The room is registered in-process
    Ready,
    /// The room must be looked up in the durable store first
    NeedsLookup,
}

impl Hub {
    /// Validate a join request and settle the connection's role. A connection opened
    /// without join parameters takes the role of its first request: the requested one,
    /// or student when the request names a room without asking to host.
    pub fn begin_join(
        &mut self,
        id: ConnectionId,
        code: &str,
        requested_role: Option<Role>,
    ) -> Result<JoinStep, JoinRejection> {
        let entry = self.connections.get_mut(&id).ok_or(JoinRejection::UnknownConnection)?;
        if entry.state != ConnectionState::AwaitingRoomJoin {
            return Err(JoinRejection::AlreadyJoined);
        }
        if entry.role_fixed {
            if requested_role.is_some_and(|role| role != entry.role) {
                return Err(JoinRejection::RoleMismatch);
            }
        } else {
            entry.role = requested_role.unwrap_or(Role::Student);
            entry.role_fixed = true;
            debug!(conn_id = %id, role = %entry.role, "Role assigned by join request");
        }
        let role = entry.role;

        if !is_valid_code(code) {
            return Err(JoinRejection::InvalidCode(code.to_string()));
        }
        if role == Role::Student && self.rejected.contains(code) {
            debug!(conn_id = %id, room_code = %code, "Join refused from rejected-code cache");
            return Err(JoinRejection::RoomNotFound(code.to_string()));
        }

        if self.registry.contains(code) {
            Ok(JoinStep::Ready)
        } else {
            Ok(JoinStep::NeedsLookup)
        }
    }

    /// Resolve the room and bind the connection to it. `snapshot` is what the durable
    /// store returned for a room that was not registered locally.
    pub fn complete_join(
        &mut self,
        id: ConnectionId,
        code: &str,
        snapshot: Option<RoomSnapshot>,
    ) -> Result<Role, JoinRejection> {
        let role = match self.connections.get(&id) {
            None => return Err(JoinRejection::UnknownConnection),
            Some(entry) if entry.state != ConnectionState::AwaitingRoomJoin => {
                return Err(JoinRejection::AlreadyJoined)
            }
            Some(entry) => entry.role,
        };

        if !self.registry.contains(code) {
            match (snapshot, role) {
                (Some(snapshot), _) => {
                    self.registry.hydrate(code, snapshot);
                    self.rejected.remove(code);
                    info!(room_code = %code, "Room restored from durable store");
                }
                (None, Role::Host) => {
                    self.registry
                        .create_room(code)
                        .map_err(|_| JoinRejection::InvalidCode(code.to_string()))?;
                    self.rejected.remove(code);
                    info!(room_code = %code, "Room opened by host");
                }
                (None, Role::Student) => {
                    self.rejected.insert(code);
                    return Err(JoinRejection::RoomNotFound(code.to_string()));
                }
            }
        }

        match role {
            Role::Host => self.claim_host_slot(id, code)?,
            Role::Student => {
                let count = self.registry.get(code).map_or(0, |room| room.student_count());
                if count >= self.policy.max_students {
                    return Err(JoinRejection::RoomFull {
                        max_students: self.policy.max_students,
                    });
                }
                if let Some(room) = self.registry.get_mut(code) {
                    room.add_student(id);
                }
            }
        }

        if let Some(entry) = self.connections.get_mut(&id) {
            entry.room_code = Some(code.to_string());
            entry.state = ConnectionState::Joined;
            entry.alive = true;
            entry.probe_sent = None;
        }
        info!(conn_id = %id, room_code = %code, role = %role, "Connection joined room");

        self.send_to(
            id,
            ServerMessage::RoomJoined {
                room_code: code.to_string(),
                role,
                message: format!("Joined room {} as {}", code, role),
            },
        );
        let history = self.registry.get(code).map(|room| room.transcript()).unwrap_or_default();
        if role == Role::Student && !history.is_empty() {
            self.send_to(id, ServerMessage::TranscriptHistory { data: history });
        }
        self.persist(code);

        Ok(role)
    }

    /// Take the host slot of `code` for `id`. The current host keeps the slot unless a
    /// probe to it has gone unanswered for a full heartbeat interval; then it is
    /// terminated and replaced.
    fn claim_host_slot(&mut self, id: ConnectionId, code: &str) -> Result<(), JoinRejection> {
        let current = self.registry.get(code).and_then(|room| room.host());
        if let Some(current) = current.filter(|current| *current != id) {
            let grace = self.policy.host_probe_grace;
            let responsive = self.connections.get(&current).is_some_and(|c| {
                c.alive || c.probe_sent.map_or(true, |sent| sent.elapsed() < grace)
            });
            if responsive {
                return Err(JoinRejection::HostPresent);
            }
            warn!(room_code = %code, old_host = %current, new_host = %id, "Replacing unresponsive host");
            if let Some(old) = self.connections.get_mut(&current) {
                old.room_code = None;
                old.state = ConnectionState::Closed;
            }
            self.push(current, ClientCommand::Terminate);
        }

        if let Some(room) = self.registry.get_mut(code) {
            room.set_host(Some(id));
        }
        Ok(())
    }

    /// Report a refused join to the client, closing the connection when required.
    pub fn reject_join(&mut self, id: ConnectionId, rejection: &JoinRejection) {
        warn!(conn_id = %id, reason = %rejection, "Join rejected");
        self.send_to(
            id,
            ServerMessage::RoomError {
                message: rejection.to_string(),
            },
        );
        if rejection.closes_connection() {
            if let Some(entry) = self.connections.get_mut(&id) {
                entry.state = ConnectionState::Closed;
            }
            self.push(
                id,
                ClientCommand::Close {
                    reason: rejection.to_string(),
                },
            );
        }
    }

    /// Close a connection that never joined a room within the join window.
    /// Returns false when the connection has joined (or gone) in the meantime.
    pub fn expire_unjoined(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(entry) if entry.state == ConnectionState::AwaitingRoomJoin && entry.room_code.is_none() => {
                entry.state = ConnectionState::Closed;
            }
            _ => return false,
        }
        info!(conn_id = %id, "Join timeout, closing connection");
        self.send_to(id, ServerMessage::info("Join timeout: no room joined"));
        self.push(
            id,
            ClientCommand::Close {
                reason: "join timeout".to_string(),
            },
        );
        true
    }

    /// Forget a connection and detach it from its room, applying the retention policy.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let Some(entry) = self.connections.remove(&id) else {
            return;
        };
        debug!(conn_id = %id, role = %entry.role, "Connection removed");

        let Some(code) = entry.room_code else {
            return;
        };
        let (was_host, vacant) = match self.registry.get_mut(&code) {
            Some(room) => {
                let was_host = room.host() == Some(id);
                if !room.remove_participant(id) {
                    return;
                }
                (was_host, room.is_vacant())
            }
            None => return,
        };
        info!(conn_id = %id, room_code = %code, role = %entry.role, "Left room");

        if was_host && !self.policy.keep_room_on_host_leave {
            self.close_room(&code, "The host has left, this room is closed");
            return;
        }
        if vacant && self.policy.close_empty_rooms {
            self.registry.remove(&code);
            info!(room_code = %code, "Empty room removed");
            return;
        }
        self.persist(&code);
    }

    /// Remove a room, dismissing its students and deleting the durable copy.
    fn close_room(&mut self, code: &str, notice: &str) {
        let Some(room) = self.registry.remove(code) else {
            return;
        };
        for student in room.students() {
            if let Some(entry) = self.connections.get_mut(student) {
                entry.room_code = None;
                entry.state = ConnectionState::Closed;
            }
            self.send_to(*student, ServerMessage::info(notice));
            self.push(
                *student,
                ClientCommand::Close {
                    reason: "room closed".to_string(),
                },
            );
        }
        self.durable.delete_detached(code.to_string());
        info!(room_code = %code, students = room.student_count(), "Room closed");
    }
}

/// Run the full join handshake for `id`, consulting the durable store when the room
/// is not registered locally. Rejections are reported to the client before returning.
pub async fn join_room(
    hub: &SharedHub,
    durable: &DurableRooms,
    id: ConnectionId,
    code: &str,
    requested_role: Option<Role>,
) -> Result<Role, JoinRejection> {
    let step = hub.lock().begin_join(id, code, requested_role);
    let snapshot = match step {
        Ok(JoinStep::Ready) => None,
        Ok(JoinStep::NeedsLookup) => durable.load(code).await,
        Err(rejection) => {
            hub.lock().reject_join(id, &rejection);
            return Err(rejection);
        }
    };

    let result = hub.lock().complete_join(id, code, snapshot);
    if let Err(rejection) = &result {
        hub.lock().reject_join(id, rejection);
    }
    result
}
