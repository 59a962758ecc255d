//! # Room State
//!
//! A room holds references to its participants (never the connections themselves),
//! and a transcript ring buffer of the most recent recognized utterances.
//!
//! ## Invariants:
//! - At most one host slot; students are unique and kept in join order
//! - `transcript.len() <= transcript_limit`, oldest entries evicted first
//! - `last_activity` moves forward on every mutation

use crate::hub::ConnectionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One recognized utterance in a room's transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Connection-free view of a room, as written to the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub is_active: bool,
    pub has_host: bool,
    pub student_count: usize,
    pub transcript: Vec<TranscriptEntry>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Room {
    code: String,
    host: Option<ConnectionId>,
    students: Vec<ConnectionId>,
    transcript: VecDeque<TranscriptEntry>,
    transcript_limit: usize,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Room {
    pub fn new(code: impl Into<String>, transcript_limit: usize) -> Self {
        let now = Utc::now();
        Self {
            code: code.into(),
            host: None,
            students: Vec::new(),
            transcript: VecDeque::with_capacity(transcript_limit),
            transcript_limit,
            created_at: now,
            last_activity: now,
        }
    }

    /// Rebuild a shadow room from a stored snapshot.
    ///
    /// Participants are never restored: the host slot starts empty and students have
    /// to reconnect. Only the newest `transcript_limit` entries are kept.
    pub fn from_snapshot(code: impl Into<String>, snapshot: RoomSnapshot, transcript_limit: usize) -> Self {
        let skip = snapshot.transcript.len().saturating_sub(transcript_limit);
        Self {
            code: code.into(),
            host: None,
            students: Vec::new(),
            transcript: snapshot.transcript.into_iter().skip(skip).collect(),
            transcript_limit,
            created_at: snapshot.created_at,
            last_activity: Utc::now(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn host(&self) -> Option<ConnectionId> {
        self.host
    }

    pub fn set_host(&mut self, host: Option<ConnectionId>) {
        self.host = host;
        self.touch();
    }

    pub fn students(&self) -> &[ConnectionId] {
        &self.students
    }

    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    /// Append a student; returns false if the connection is already listed.
    pub fn add_student(&mut self, id: ConnectionId) -> bool {
        if self.students.contains(&id) {
            return false;
        }
        self.students.push(id);
        self.touch();
        true
    }

    pub fn remove_student(&mut self, id: ConnectionId) -> bool {
        let before = self.students.len();
        self.students.retain(|s| *s != id);
        let removed = self.students.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Detach `id` from whichever slot it occupies.
    pub fn remove_participant(&mut self, id: ConnectionId) -> bool {
        if self.host == Some(id) {
            self.set_host(None);
            return true;
        }
        self.remove_student(id)
    }

    /// True when neither a host nor any student is attached.
    pub fn is_vacant(&self) -> bool {
        self.host.is_none() && self.students.is_empty()
    }

    pub fn append_transcript(&mut self, text: impl Into<String>) -> TranscriptEntry {
        let entry = TranscriptEntry {
            text: text.into(),
            timestamp: Utc::now(),
        };
        while self.transcript.len() >= self.transcript_limit {
            self.transcript.pop_front();
        }
        self.transcript.push_back(entry.clone());
        self.touch();
        entry
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.iter().cloned().collect()
    }

    pub fn transcript_len(&self) -> usize {
        self.transcript.len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            is_active: true,
            has_host: self.host.is_some(),
            student_count: self.students.len(),
            transcript: self.transcript(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
