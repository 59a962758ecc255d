//! # WebSocket Protocol
//!
//! Message shapes exchanged with browser clients over `/ws`.
//!
//! ## Message Format:
//! - **Client → Server**: binary audio frames, or JSON tagged with `type`
//!   (`text_submit`, `join_room`, `set_languages`, `stream_start`, `stream_stop`,
//!   `ping`, `pong`)
//! - **Server → Client**: JSON tagged with `type` (`info`, `room_joined`, `room_error`,
//!   `error`, `recognized`, `partial`, `translation`, `transcript_history`, `pong`)
//!
//! Text frames must hold a structured message. Binary frames that do not parse as
//! one are treated as raw audio.

use crate::hub::Role;
use crate::rooms::TranscriptEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Info {
        message: String,
    },
    RoomJoined {
        #[serde(rename = "roomCode")]
        room_code: String,
        role: Role,
        message: String,
    },
    RoomError {
        message: String,
    },
    Error {
        message: String,
    },
    Recognized {
        data: String,
    },
    /// Interim streaming result, only ever sent to the submitting host
    Partial {
        data: String,
    },
    Translation {
        lang: String,
        data: String,
    },
    TranscriptHistory {
        data: Vec<TranscriptEntry>,
    },
    Pong,
}

impl ServerMessage {
    pub fn info(message: impl Into<String>) -> Self {
        ServerMessage::Info { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Language list accepted either as a JSON array or a comma-separated string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LanguageList {
    List(Vec<String>),
    Csv(String),
}

impl LanguageList {
    pub fn into_languages(self) -> Vec<String> {
        match self {
            LanguageList::List(items) => normalize_languages(items),
            LanguageList::Csv(csv) => parse_languages(&csv),
        }
    }
}

/// Structured messages from clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    TextSubmit {
        text: String,
        #[serde(default)]
        lang: Option<String>,
    },
    JoinRoom {
        #[serde(rename = "roomCode")]
        room_code: String,
        #[serde(default, rename = "isHost")]
        is_host: Option<bool>,
        #[serde(default, rename = "targetLangs")]
        target_langs: Option<LanguageList>,
    },
    SetLanguages {
        #[serde(rename = "targetLangs")]
        target_langs: LanguageList,
    },
    StreamStart {
        #[serde(default)]
        lang: Option<String>,
    },
    StreamStop,
    Ping,
    Pong,
}

/// A classified inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Structured(ClientMessage),
    Audio(Bytes),
}

/// Try the payload as a structured message first, otherwise treat it as audio.
pub fn classify(payload: Bytes) -> Inbound {
    match serde_json::from_slice::<ClientMessage>(&payload) {
        Ok(message) => Inbound::Structured(message),
        Err(_) => Inbound::Audio(payload),
    }
}

/// Parse a text frame. Text is never audio, so a malformed message is an error.
pub fn parse_text_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Split a comma-separated language list, dropping blanks and duplicates.
pub fn parse_languages(csv: &str) -> Vec<String> {
    normalize_languages(csv.split(',').map(str::to_string))
}

fn normalize_languages(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut languages: Vec<String> = Vec::new();
    for item in items {
        let lang = item.trim();
        if !lang.is_empty() && !languages.iter().any(|l| l == lang) {
            languages.push(lang.to_string());
        }
    }
    languages
}

/// Join parameters carried in the `/ws` query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinQuery {
    #[serde(default, rename = "roomCode")]
    pub room_code: Option<String>,
    #[serde(default, rename = "isHost")]
    pub is_host: Option<String>,
    #[serde(default, rename = "targetLangs")]
    pub target_langs: Option<String>,
}

/// Parsed join parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinParams {
    pub room_code: Option<String>,
    /// `None` for a bare connection, whose role is settled by its first join request
    pub requested_role: Option<Role>,
    pub target_languages: Vec<String>,
}

impl JoinParams {
    /// Role the connection starts with. A bare connection acts as a host, i.e. a
    /// free-floating translation client that submits its own audio.
    pub fn role(&self) -> Role {
        self.requested_role.unwrap_or(Role::Host)
    }
}

impl From<JoinQuery> for JoinParams {
    /// A room code without `isHost` joins as a student.
    fn from(query: JoinQuery) -> Self {
        let room_code = query
            .room_code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let requested_role = match query.is_host.as_deref().map(str::trim) {
            Some("true") | Some("1") => Some(Role::Host),
            Some(_) => Some(Role::Student),
            None if room_code.is_some() => Some(Role::Student),
            None => None,
        };
        JoinParams {
            room_code,
            requested_role,
            target_languages: query.target_langs.as_deref().map(parse_languages).unwrap_or_default(),
        }
    }
}
