//! # External Speech and Language Services
//!
//! The relay never transcribes or translates anything itself. It talks to three
//! collaborator seams:
//!
//! - **Transcriber**: one audio buffer in, recognized text out
//! - **Translator**: one text in, a `{language: translation}` map out for a batch of languages
//! - **StreamingTranscriber**: opens a per-connection session that is fed audio incrementally
//!   and reports partial and final results as `StreamEvent`s
//!
//! `openai` implements the first two against any OpenAI-compatible HTTP API;
//! `streaming` builds the third on top of a `Transcriber`.

pub mod openai;
pub mod streaming;

pub use openai::OpenAiClient;
pub use streaming::ChunkedStreaming;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The request never produced a response (connect error, timeout)
    Request(String),
    /// The service answered with a non-success status
    Api { status: u16, body: String },
    /// The response could not be understood
    InvalidResponse(String),
    /// The streaming session was already closed
    SessionClosed,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Request(msg) => write!(f, "Service request failed: {}", msg),
            ServiceError::Api { status, body } => write!(f, "Service returned {}: {}", status, body),
            ServiceError::InvalidResponse(msg) => write!(f, "Invalid service response: {}", msg),
            ServiceError::SessionClosed => write!(f, "Streaming session is closed"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Request(err.to_string())
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Bytes) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into every language of `targets` in a single call.
    /// Languages the service did not answer for are absent from the map.
    async fn translate_batch(&self, text: &str, targets: &[String]) -> Result<HashMap<String, String>, ServiceError>;
}

/// Result notifications from a streaming session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Partial(String),
    Final(String),
    Error(String),
}

/// An open streaming session, owned by exactly one connection.
pub trait StreamSession: Send {
    fn send(&mut self, audio: Bytes) -> Result<(), ServiceError>;

    /// Flush buffered audio and end the session. Idempotent.
    fn close(&mut self);
}

pub trait StreamingTranscriber: Send + Sync {
    /// Open a session reporting into `events`. The event stream ends after the
    /// session has been closed and its remaining audio processed.
    fn open_session(&self, events: mpsc::UnboundedSender<StreamEvent>) -> Box<dyn StreamSession>;
}
