//! Event multiplexer - ordered, lossless, back-pressured per-session events
//!
//! Each session has one event stream with one consumer (the transport
//! adapter). Events carry the session id and a monotonically increasing
//! sequence number; sequence assignment and channel send happen under one
//! lock so delivery order always matches numbering. The channel is bounded:
//! a slow consumer blocks the producing turn rather than dropping events.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::InterruptReason;
use crate::verify::VerificationSummary;

/// Everything a session can tell its transport, in wire naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum SessionEvent {
    #[serde(rename = "audio.chunk")]
    AudioChunk {
        bytes: usize,
        sample_rate: u32,
        channels: u16,
    },
    #[serde(rename = "audio.end")]
    AudioEnd,
    #[serde(rename = "transcript.partial")]
    TranscriptPartial {
        text: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    #[serde(rename = "transcript.final")]
    TranscriptFinal {
        text: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    #[serde(rename = "generation.start")]
    GenerationStart,
    #[serde(rename = "generation.chunk")]
    GenerationChunk { token: String },
    #[serde(rename = "generation.end")]
    GenerationEnd {
        text: String,
        verification: VerificationSummary,
    },
    #[serde(rename = "synthesis.start")]
    SynthesisStart,
    #[serde(rename = "synthesis.chunk")]
    SynthesisChunk {
        #[serde(serialize_with = "audio_as_base64")]
        audio: Vec<u8>,
    },
    #[serde(rename = "synthesis.stop")]
    SynthesisStop,
    #[serde(rename = "synthesis.end")]
    SynthesisEnd,
    #[serde(rename = "session.created")]
    SessionCreated {
        session_id: Uuid,
        conversation_id: Uuid,
    },
    #[serde(rename = "session.interrupted")]
    SessionInterrupted { reason: InterruptReason },
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioChunk { .. } => "audio.chunk",
            Self::AudioEnd => "audio.end",
            Self::TranscriptPartial { .. } => "transcript.partial",
            Self::TranscriptFinal { .. } => "transcript.final",
            Self::GenerationStart => "generation.start",
            Self::GenerationChunk { .. } => "generation.chunk",
            Self::GenerationEnd { .. } => "generation.end",
            Self::SynthesisStart => "synthesis.start",
            Self::SynthesisChunk { .. } => "synthesis.chunk",
            Self::SynthesisStop => "synthesis.stop",
            Self::SynthesisEnd => "synthesis.end",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionInterrupted { .. } => "session.interrupted",
            Self::Error { .. } => "error",
        }
    }
}

fn audio_as_base64<S: serde::Serializer>(audio: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    use base64::Engine;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(audio))
}

/// Error kinds observable at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TranscriptionFailed,
    GenerationFailed,
    SynthesisFailed,
    VerificationUnavailable,
    UpstreamCircuitOpen,
    Timeout,
    SessionNotFound,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TranscriptionFailed => "transcription_failed",
            Self::GenerationFailed => "generation_failed",
            Self::SynthesisFailed => "synthesis_failed",
            Self::VerificationUnavailable => "verification_unavailable",
            Self::UpstreamCircuitOpen => "upstream_circuit_open",
            Self::Timeout => "timeout",
            Self::SessionNotFound => "session_not_found",
        }
    }

    /// Recoverable errors leave the session in `idle`; the rest terminate it.
    pub fn recoverable(self) -> bool {
        !matches!(self, Self::SessionNotFound)
    }
}

/// One event on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub session_id: Uuid,
    pub seq: u64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Build the per-session event pair. `capacity` bounds the in-flight queue;
/// producers block when the consumer lags.
pub fn channel(session_id: Uuid, capacity: usize) -> (EventPublisher, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventPublisher {
            session_id,
            tx,
            seq: Arc::new(tokio::sync::Mutex::new(0)),
        },
        EventStream { rx },
    )
}

/// Producer half. Cloneable; all clones share one sequence counter.
#[derive(Clone)]
pub struct EventPublisher {
    session_id: Uuid,
    tx: mpsc::Sender<EventEnvelope>,
    seq: Arc<tokio::sync::Mutex<u64>>,
}

impl EventPublisher {
    /// Emit one event, blocking on back-pressure. Fails only when the
    /// consumer has gone away.
    pub async fn emit(&self, event: SessionEvent) -> Result<(), EventError> {
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let envelope = EventEnvelope {
            session_id: self.session_id,
            seq: *seq,
            event,
        };
        self.tx.send(envelope).await.map_err(|_| EventError::Closed)
    }

    /// Emit only if `guard` still holds, evaluated atomically with sequence
    /// assignment. This is how obsolete synthesis work is dropped: once an
    /// interrupt has rotated the response id, no stale chunk can slip out
    /// after the `synthesis.stop` marker. Returns whether the event was sent.
    pub async fn emit_guarded(
        &self,
        event: SessionEvent,
        guard: impl FnOnce() -> bool,
    ) -> Result<bool, EventError> {
        let mut seq = self.seq.lock().await;
        if !guard() {
            return Ok(false);
        }
        *seq += 1;
        let envelope = EventEnvelope {
            session_id: self.session_id,
            seq: *seq,
            event,
        };
        self.tx
            .send(envelope)
            .await
            .map(|_| true)
            .map_err(|_| EventError::Closed)
    }
}

/// Consumer half - exactly one per session.
pub struct EventStream {
    rx: mpsc::Receiver<EventEnvelope>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event consumer disconnected")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_are_monotonic() {
        let (publisher, mut stream) = channel(Uuid::new_v4(), 8);
        publisher.emit(SessionEvent::GenerationStart).await.unwrap();
        publisher
            .emit(SessionEvent::GenerationChunk { token: "hi".into() })
            .await
            .unwrap();
        publisher.emit(SessionEvent::SynthesisEnd).await.unwrap();

        let seqs: Vec<u64> = vec![
            stream.next().await.unwrap().seq,
            stream.next().await.unwrap().seq,
            stream.next().await.unwrap().seq,
        ];
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn guarded_emit_drops_event_without_consuming_seq() {
        let (publisher, mut stream) = channel(Uuid::new_v4(), 8);
        let sent = publisher
            .emit_guarded(SessionEvent::SynthesisChunk { audio: vec![0u8; 4] }, || false)
            .await
            .unwrap();
        assert!(!sent);

        publisher.emit(SessionEvent::SynthesisStop).await.unwrap();
        let envelope = stream.next().await.unwrap();
        assert_eq!(envelope.seq, 1);
        assert_eq!(envelope.event.kind(), "synthesis.stop");
    }

    #[tokio::test]
    async fn bounded_channel_applies_backpressure() {
        let (publisher, mut stream) = channel(Uuid::new_v4(), 1);
        publisher.emit(SessionEvent::AudioEnd).await.unwrap();

        // Second emit must wait until the consumer drains one slot.
        let pending = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.emit(SessionEvent::SynthesisEnd).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        assert_eq!(stream.next().await.unwrap().event.kind(), "audio.end");
        pending.await.unwrap().unwrap();
        assert_eq!(stream.next().await.unwrap().event.kind(), "synthesis.end");
    }

    #[tokio::test]
    async fn emit_fails_after_consumer_drops() {
        let (publisher, stream) = channel(Uuid::new_v4(), 1);
        drop(stream);
        assert!(matches!(
            publisher.emit(SessionEvent::AudioEnd).await,
            Err(EventError::Closed)
        ));
    }

    #[test]
    fn envelope_serializes_with_dotted_kind() {
        let envelope = EventEnvelope {
            session_id: Uuid::nil(),
            seq: 7,
            event: SessionEvent::TranscriptFinal {
                text: "hello".into(),
                is_final: true,
                confidence: None,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "transcript.final");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn synthesis_chunk_serializes_audio_as_base64() {
        let json = serde_json::to_value(SessionEvent::SynthesisChunk {
            audio: vec![1, 2, 3],
        })
        .unwrap();
        assert_eq!(json["audio"], "AQID");
    }
}
