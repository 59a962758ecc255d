//! # Message Router
//!
//! Turns host submissions into recognized text and translations and fans them out.
//!
//! ## Paths:
//! - **Audio**: transcribe → translate into the room's requested languages → deliver
//! - **Text**: translate into the requested languages plus the baseline language → deliver
//! - **Streaming**: final results from a streaming session enter at `deliver_final`
//!
//! Collaborator calls run with the hub unlocked. Delivery takes the lock once: the
//! submitter gets the recognized text and every translation, and if it belongs to a
//! room the transcript is appended, the same messages go to every student one by one
//! (a failed recipient is skipped), and the snapshot is persisted in the background.

use crate::hub::{ConnectionId, ConnectionState, Hub, Role, SharedHub};
use crate::protocol::ServerMessage;
use crate::services::{Transcriber, Translator};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Client-facing message for students that try to submit content.
pub const HOST_ONLY: &str = "Only the host can submit audio or text";

impl Hub {
    /// Check that `id` may submit content. Students are told why they were refused.
    pub fn authorize_submission(&self, id: ConnectionId) -> bool {
        let Some(entry) = self.connections.get(&id) else {
            return false;
        };
        if entry.state == ConnectionState::Closed {
            return false;
        }
        if entry.role != Role::Host {
            debug!(conn_id = %id, "Discarding submission from student");
            self.send_error(id, HOST_ONLY);
            return false;
        }
        true
    }

    /// Languages to translate a submission from `id` into: its own requested languages,
    /// those of every student in its room, then `extra`, in that order without duplicates.
    pub fn target_languages(&self, id: ConnectionId, extra: Option<&str>) -> Vec<String> {
        let mut languages: Vec<String> = Vec::new();
        let mut add = |lang: &str| {
            if !languages.iter().any(|l| l == lang) {
                languages.push(lang.to_string());
            }
        };

        let Some(entry) = self.connections.get(&id) else {
            return Vec::new();
        };
        entry.target_languages.iter().for_each(|l| add(l.as_str()));

        let room = entry.room_code.as_deref().and_then(|code| self.registry.get(code));
        if let Some(room) = room {
            for student in room.students() {
                if let Some(student) = self.connections.get(student) {
                    student.target_languages.iter().for_each(|l| add(l.as_str()));
                }
            }
        }
        if let Some(extra) = extra {
            add(extra);
        }
        languages
    }

    /// Deliver a final result from `id` and record it in its room, if any.
    pub fn deliver(&mut self, id: ConnectionId, text: &str, translations: &[(String, String)]) {
        let mut messages = Vec::with_capacity(translations.len() + 1);
        messages.push(ServerMessage::Recognized { data: text.to_string() });
        messages.extend(translations.iter().map(|(lang, data)| ServerMessage::Translation {
            lang: lang.clone(),
            data: data.clone(),
        }));

        for message in &messages {
            self.send_to(id, message.clone());
        }

        let Some(code) = self.connection_room(id).map(str::to_string) else {
            return;
        };
        let Some(room) = self.registry.get_mut(&code) else {
            return;
        };
        room.append_transcript(text);
        let students = room.students().to_vec();

        let mut failed = 0;
        for student in &students {
            for message in &messages {
                if !self.send_to(*student, message.clone()) {
                    failed += 1;
                    break;
                }
            }
        }
        if failed > 0 {
            warn!(room_code = %code, failed, "Broadcast partially failed");
        }
        debug!(room_code = %code, students = students.len(), translations = translations.len(), "Broadcast delivered");

        self.persist(&code);
    }
}

/// Runs host submissions through the collaborators and delivers the results.
#[derive(Clone)]
pub struct Router {
    hub: SharedHub,
    transcriber: Arc<dyn Transcriber>,
    translator: Arc<dyn Translator>,
    baseline_language: String,
}

impl Router {
    pub fn new(
        hub: SharedHub,
        transcriber: Arc<dyn Transcriber>,
        translator: Arc<dyn Translator>,
        baseline_language: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            transcriber,
            translator,
            baseline_language: baseline_language.into(),
        }
    }

    pub fn hub(&self) -> &SharedHub {
        &self.hub
    }

    pub async fn handle_audio(&self, id: ConnectionId, audio: Bytes) {
        if !self.hub.lock().authorize_submission(id) {
            return;
        }
        debug!(conn_id = %id, bytes = audio.len(), "Transcribing audio");

        let text = match self.transcriber.transcribe(audio).await {
            Ok(text) => text,
            Err(e) => {
                error!(conn_id = %id, error = %e, "Transcription failed");
                self.hub.lock().send_error(id, format!("Transcription failed: {}", e));
                return;
            }
        };
        if text.trim().is_empty() {
            debug!(conn_id = %id, "Transcription produced no text");
            return;
        }
        self.deliver_final(id, text, None).await;
    }

    pub async fn handle_text(&self, id: ConnectionId, text: String, lang: Option<String>) {
        if !self.hub.lock().authorize_submission(id) {
            return;
        }
        if text.trim().is_empty() {
            self.hub.lock().send_error(id, "Text submission is empty");
            return;
        }
        info!(conn_id = %id, source_lang = ?lang, chars = text.len(), "Text submitted");
        let baseline = self.baseline_language.clone();
        self.deliver_final(id, text, Some(&baseline)).await;
    }

    /// Translate `text` and deliver it. Used by the batch paths and by streaming
    /// sessions reporting a final result.
    pub async fn deliver_final(&self, id: ConnectionId, text: String, extra_language: Option<&str>) {
        let targets = self.hub.lock().target_languages(id, extra_language);

        let translations = if targets.is_empty() {
            Vec::new()
        } else {
            match self.translator.translate_batch(&text, &targets).await {
                Ok(mut found) => targets
                    .iter()
                    .filter_map(|lang| found.remove(lang).map(|t| (lang.clone(), t)))
                    .collect(),
                Err(e) => {
                    error!(conn_id = %id, error = %e, "Translation failed");
                    self.hub.lock().send_error(id, format!("Translation failed: {}", e));
                    return;
                }
            }
        };

        self.hub.lock().deliver(id, &text, &translations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{connect, memory_durable, test_hub, test_hub_with, test_policy, RecordingSink};
    use crate::lifecycle::join_room;
    use crate::rooms::DurableRooms;
    use crate::services::fakes::{ScriptedTranscriber, ScriptedTranslator};
    use crate::services::{ChunkedStreaming, StreamEvent, StreamingTranscriber};
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    struct Classroom {
        router: Router,
        transcriber: Arc<ScriptedTranscriber>,
        translator: Arc<ScriptedTranslator>,
        host: ConnectionId,
        host_sink: RecordingSink,
        students: Vec<(ConnectionId, RecordingSink)>,
    }

    async fn classroom(hub: SharedHub, durable: &DurableRooms, student_langs: &[&[&str]]) -> Classroom {
        let transcriber = Arc::new(ScriptedTranscriber::returning("good morning"));
        let translator = Arc::new(ScriptedTranslator::default());
        let router = Router::new(hub.clone(), transcriber.clone(), translator.clone(), "English");

        let (host, host_sink) = connect(&hub, Role::Host, &[]);
        join_room(&hub, durable, host, "12345", None).await.unwrap();
        let mut students = Vec::new();
        for langs in student_langs {
            let (id, sink) = connect(&hub, Role::Student, langs);
            join_room(&hub, durable, id, "12345", None).await.unwrap();
            sink.clear();
            students.push((id, sink));
        }
        host_sink.clear();

        Classroom {
            router,
            transcriber,
            translator,
            host,
            host_sink,
            students,
        }
    }

    #[tokio::test]
    async fn test_text_submission_reaches_host_and_students() {
        let hub = test_hub();
        let room = classroom(hub.clone(), &DurableRooms::disabled(), &[&["Spanish"]]).await;

        room.router.handle_text(room.host, "hello".into(), Some("English".into())).await;

        let recognized = ServerMessage::Recognized { data: "hello".into() };
        let spanish = ServerMessage::Translation {
            lang: "Spanish".into(),
            data: "Spanish:hello".into(),
        };
        for sink in [&room.host_sink, &room.students[0].1] {
            let messages = sink.messages();
            assert_eq!(messages[0], recognized);
            assert!(messages.contains(&spanish));
        }
        // Baseline language is always requested for text.
        assert_eq!(*room.translator.last_targets.lock().unwrap(), vec!["Spanish", "English"]);

        let guard = hub.lock();
        let transcript = guard.registry().get("12345").unwrap().transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].text, "hello");
    }

    #[tokio::test]
    async fn test_audio_uses_union_of_student_languages() {
        let hub = test_hub();
        let room = classroom(
            hub.clone(),
            &DurableRooms::disabled(),
            &[&["Spanish"], &["French", "Spanish"], &[]],
        )
        .await;

        room.router.handle_audio(room.host, Bytes::from_static(b"webm")).await;

        assert_eq!(*room.translator.last_targets.lock().unwrap(), vec!["Spanish", "French"]);
        assert_eq!(room.translator.calls.load(Ordering::SeqCst), 1);
        for (_, sink) in &room.students {
            assert_eq!(sink.messages().len(), 3);
            assert_eq!(sink.messages()[0], ServerMessage::Recognized { data: "good morning".into() });
        }
    }

    #[tokio::test]
    async fn test_broadcast_isolation() {
        let hub = test_hub();
        let room = classroom(hub.clone(), &DurableRooms::disabled(), &[&["Spanish"], &["Spanish"], &["Spanish"]]).await;
        room.students[1].1.set_failing(true);

        room.router.handle_text(room.host, "hello".into(), None).await;

        assert!(!room.host_sink.messages().is_empty());
        assert_eq!(room.students[0].1.messages().len(), 3);
        assert!(room.students[1].1.messages().is_empty());
        assert_eq!(room.students[2].1.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_student_submission_is_rejected() {
        let hub = test_hub();
        let room = classroom(hub.clone(), &DurableRooms::disabled(), &[&["Spanish"]]).await;
        let (student, sink) = &room.students[0];

        room.router.handle_text(*student, "let me talk".into(), None).await;
        room.router.handle_audio(*student, Bytes::from_static(b"noise")).await;

        assert_eq!(sink.messages(), vec![ServerMessage::error(HOST_ONLY), ServerMessage::error(HOST_ONLY)]);
        assert!(room.host_sink.messages().is_empty());
        assert_eq!(room.transcriber.calls.load(Ordering::SeqCst), 0);
        assert_eq!(hub.lock().registry().get("12345").unwrap().transcript_len(), 0);
    }

    #[tokio::test]
    async fn test_collaborator_failures_notify_host_only() {
        let hub = test_hub();
        let room = classroom(hub.clone(), &DurableRooms::disabled(), &[&["Spanish"]]).await;

        room.transcriber.failing.store(true, Ordering::SeqCst);
        room.router.handle_audio(room.host, Bytes::from_static(b"webm")).await;
        room.transcriber.failing.store(false, Ordering::SeqCst);

        room.translator.failing.store(true, Ordering::SeqCst);
        room.router.handle_audio(room.host, Bytes::from_static(b"webm")).await;

        let host_messages = room.host_sink.messages();
        assert_eq!(host_messages.len(), 2);
        assert!(host_messages.iter().all(|m| matches!(m, ServerMessage::Error { .. })));
        assert!(room.students[0].1.messages().is_empty());
        assert!(!room.host_sink.was_closed());
    }

    #[tokio::test]
    async fn test_free_floating_host_gets_own_translations() {
        let hub = test_hub();
        let transcriber = Arc::new(ScriptedTranscriber::returning("bonjour"));
        let translator = Arc::new(ScriptedTranslator::default());
        let router = Router::new(hub.clone(), transcriber, translator, "English");
        let (solo, sink) = connect(&hub, Role::Host, &["German"]);

        router.handle_audio(solo, Bytes::from_static(b"webm")).await;

        assert_eq!(
            sink.messages(),
            vec![
                ServerMessage::Recognized { data: "bonjour".into() },
                ServerMessage::Translation {
                    lang: "German".into(),
                    data: "German:bonjour".into(),
                },
            ]
        );
        assert_eq!(hub.lock().stats().rooms, 0);
    }

    #[tokio::test]
    async fn test_delivery_does_not_wait_for_persistence() {
        let (store, durable) = memory_durable();
        let hub = test_hub_with(test_policy(), durable.clone());
        let room = classroom(hub.clone(), &durable, &[&["Spanish"]]).await;
        durable.flush().await;
        let before = store.writes();
        store.hold_writes();

        room.router.handle_text(room.host, "hello".into(), None).await;
        assert_eq!(room.students[0].1.messages().len(), 3);
        assert_eq!(store.writes(), before);

        store.release_writes();
        durable.flush().await;
        assert_eq!(store.writes(), before + 1);
        let stored = durable.load("12345").await.unwrap();
        assert_eq!(stored.transcript[0].text, "hello");
    }

    #[tokio::test]
    async fn test_broadcast_with_store_unavailable() {
        let (store, durable) = memory_durable();
        store.set_available(false);
        let hub = test_hub_with(test_policy(), durable.clone());
        let room = classroom(hub.clone(), &durable, &[&["Spanish"]]).await;

        room.router.handle_text(room.host, "hello".into(), None).await;
        assert_eq!(room.students[0].1.messages().len(), 3);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_language_update_changes_targets() {
        let hub = test_hub();
        let room = classroom(hub.clone(), &DurableRooms::disabled(), &[&["Spanish"]]).await;
        hub.lock().set_languages(room.students[0].0, vec!["Japanese".into()]);

        room.router.handle_audio(room.host, Bytes::from_static(b"webm")).await;
        assert_eq!(*room.translator.last_targets.lock().unwrap(), vec!["Japanese"]);
    }

    #[tokio::test]
    async fn test_streaming_finals_are_broadcast_and_recorded() {
        let hub = test_hub();
        let room = classroom(hub.clone(), &DurableRooms::disabled(), &[&["Spanish"]]).await;
        let streaming = ChunkedStreaming::new(Arc::new(ScriptedTranscriber::default()), 8);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut session = streaming.open_session(events_tx);
        session.send(Bytes::from_static(&[0; 8])).unwrap();
        session.send(Bytes::from_static(&[0; 5])).unwrap();
        session.close();

        while let Some(event) = events_rx.recv().await {
            if let StreamEvent::Final(text) = event {
                room.router.deliver_final(room.host, text, None).await;
            }
        }

        let guard = hub.lock();
        let texts: Vec<_> = guard
            .registry()
            .get("12345")
            .unwrap()
            .transcript()
            .into_iter()
            .map(|e| e.text)
            .collect();
        assert_eq!(texts, vec!["8 bytes", "5 bytes"]);

        let student = room.students[0].1.messages();
        assert_eq!(student[0], ServerMessage::Recognized { data: "8 bytes".into() });
        assert!(student.contains(&ServerMessage::Translation {
            lang: "Spanish".into(),
            data: "Spanish:5 bytes".into(),
        }));
        assert!(!student.iter().any(|m| matches!(m, ServerMessage::Partial { .. })));
    }
}
