//! Chunked streaming transcription built on a batch `Transcriber`.
//!
//! Each session owns a worker task that buffers incoming audio. Once half a chunk has
//! accumulated, it is transcribed once as a preview (`Partial`); a full chunk is
//! transcribed as `Final` and the buffer starts over. Closing the session flushes the
//! tail as a last `Final`. Chunks are processed in order, one at a time.

use super::{ServiceError, StreamEvent, StreamSession, StreamingTranscriber, Transcriber};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct ChunkedStreaming {
    transcriber: Arc<dyn Transcriber>,
    chunk_bytes: usize,
}

impl ChunkedStreaming {
    pub fn new(transcriber: Arc<dyn Transcriber>, chunk_bytes: usize) -> Self {
        Self {
            transcriber,
            chunk_bytes: chunk_bytes.max(1),
        }
    }
}

impl StreamingTranscriber for ChunkedStreaming {
    fn open_session(&self, events: mpsc::UnboundedSender<StreamEvent>) -> Box<dyn StreamSession> {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_session(self.transcriber.clone(), self.chunk_bytes, audio_rx, events));
        Box::new(ChunkedSession { audio: Some(audio_tx) })
    }
}

struct ChunkedSession {
    audio: Option<mpsc::UnboundedSender<Bytes>>,
}

impl StreamSession for ChunkedSession {
    fn send(&mut self, audio: Bytes) -> Result<(), ServiceError> {
        let sender = self.audio.as_ref().ok_or(ServiceError::SessionClosed)?;
        sender.send(audio).map_err(|_| ServiceError::SessionClosed)
    }

    fn close(&mut self) {
        // Dropping the sender lets the worker drain and flush.
        self.audio = None;
    }
}

impl Drop for ChunkedSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_session(
    transcriber: Arc<dyn Transcriber>,
    chunk_bytes: usize,
    mut audio: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut buffer = BytesMut::new();
    let mut previewed = false;

    while let Some(data) = audio.recv().await {
        buffer.extend_from_slice(&data);

        let event = if buffer.len() >= chunk_bytes {
            previewed = false;
            let chunk = buffer.split().freeze();
            transcribe(&*transcriber, chunk, StreamEvent::Final).await
        } else if !previewed && buffer.len() >= chunk_bytes / 2 {
            previewed = true;
            let preview = Bytes::copy_from_slice(&buffer);
            transcribe(&*transcriber, preview, StreamEvent::Partial).await
        } else {
            None
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                debug!("Streaming session listener gone, stopping worker");
                return;
            }
        }
    }

    if !buffer.is_empty() {
        if let Some(event) = transcribe(&*transcriber, buffer.freeze(), StreamEvent::Final).await {
            let _ = events.send(event);
        }
    }
    debug!("Streaming session finished");
}

async fn transcribe(
    transcriber: &dyn Transcriber,
    audio: Bytes,
    wrap: fn(String) -> StreamEvent,
) -> Option<StreamEvent> {
    match transcriber.transcribe(audio).await {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => Some(wrap(text)),
        Err(e) => {
            warn!(error = %e, "Streaming chunk transcription failed");
            Some(StreamEvent::Error(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::ScriptedTranscriber;
    use std::sync::atomic::Ordering;

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_chunks_preview_and_final() {
        let streaming = ChunkedStreaming::new(Arc::new(ScriptedTranscriber::default()), 10);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = streaming.open_session(tx);

        session.send(Bytes::from_static(&[0; 6])).unwrap();
        session.send(Bytes::from_static(&[0; 6])).unwrap();
        session.send(Bytes::from_static(&[0; 3])).unwrap();
        session.close();

        assert_eq!(
            collect(rx).await,
            vec![
                StreamEvent::Partial("6 bytes".into()),
                StreamEvent::Final("12 bytes".into()),
                StreamEvent::Final("3 bytes".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let streaming = ChunkedStreaming::new(Arc::new(ScriptedTranscriber::default()), 10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = streaming.open_session(tx);
        session.close();
        session.close();
        assert_eq!(session.send(Bytes::from_static(b"x")), Err(ServiceError::SessionClosed));
    }

    #[tokio::test]
    async fn test_failures_become_error_events() {
        let transcriber = Arc::new(ScriptedTranscriber::default());
        transcriber.failing.store(true, Ordering::SeqCst);
        let streaming = ChunkedStreaming::new(transcriber, 4);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = streaming.open_session(tx);

        session.send(Bytes::from_static(&[0; 4])).unwrap();
        drop(session);

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(_)));
    }
}
