use serde::{Deserialize, Serialize};
use uuid::Uuid;

use colloquy_voice::SessionEvent;

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

fn default_true() -> bool {
    true
}

/// Inbound messages from the client, one NDJSON object per line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.start")]
    SessionStart {
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "audio.chunk")]
    AudioChunk {
        #[serde(flatten)]
        audio: crate::audio::AudioPayload,
    },
    #[serde(rename = "audio.end")]
    AudioEnd,
    #[serde(rename = "interrupt")]
    Interrupt,
    #[serde(rename = "transcript")]
    Transcript {
        text: String,
        #[serde(default = "default_true")]
        is_final: bool,
    },
    #[serde(rename = "session.end")]
    SessionEnd,
}

/// One engine event on the wire.
#[derive(Debug, Serialize)]
pub struct OutboundEvent<'a> {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub session_id: Uuid,
    pub seq: u64,
    #[serde(flatten)]
    pub event: &'a SessionEvent,
}

impl<'a> OutboundEvent<'a> {
    pub fn new(session_id: Uuid, seq: u64, event: &'a SessionEvent) -> Self {
        Self {
            message_type: "event",
            session_id,
            seq,
            event,
        }
    }
}

/// Hello banner emitted once the session is up.
#[derive(Debug, Serialize)]
pub struct HelloMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub protocol_version: &'static str,
    pub bridge: BridgeInfo,
    pub session_id: Uuid,
    pub conversation_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct BridgeInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl HelloMessage {
    pub fn new(session_id: Uuid, conversation_id: Uuid) -> Self {
        Self {
            message_type: "hello",
            protocol_version: PROTOCOL_VERSION,
            bridge: BridgeInfo {
                name: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
            },
            session_id,
            conversation_id,
        }
    }
}

/// Typed failure reported back to the client.
#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ErrorMessage {
    pub fn new(code: BridgeErrorCode, message: impl Into<String>) -> Self {
        Self {
            message_type: "error",
            code: code.as_str(),
            message: message.into(),
            retryable: code.retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErrorCode {
    ParseError,
    InvalidMessage,
    PayloadTooLarge,
    UnsupportedAudioFormat,
    AudioDecodeFailed,
    NoSession,
    SessionAlreadyStarted,
    InternalError,
}

impl BridgeErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::UnsupportedAudioFormat => "UNSUPPORTED_AUDIO_FORMAT",
            Self::AudioDecodeFailed => "AUDIO_DECODE_FAILED",
            Self::NoSession => "NO_SESSION",
            Self::SessionAlreadyStarted => "SESSION_ALREADY_STARTED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_start() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"session.start","user_id":"u1"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SessionStart { user_id: Some(ref u) } if u == "u1"
        ));
    }

    #[test]
    fn parses_transcript_with_default_finality() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"transcript","text":"hello"}"#).unwrap();
        match msg {
            ClientMessage::Transcript { text, is_final } => {
                assert_eq!(text, "hello");
                assert!(is_final);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_control_messages() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"interrupt"}"#).unwrap(),
            ClientMessage::Interrupt
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"audio.end"}"#).unwrap(),
            ClientMessage::AudioEnd
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"runtime.goodbye"}"#).is_err());
    }

    #[test]
    fn outbound_event_flattens_payload() {
        let event = SessionEvent::GenerationChunk {
            token: "hi".into(),
        };
        let wire = serde_json::to_value(OutboundEvent::new(Uuid::nil(), 3, &event)).unwrap();
        assert_eq!(wire["type"], "event");
        assert_eq!(wire["seq"], 3);
        assert_eq!(wire["kind"], "generation.chunk");
        assert_eq!(wire["token"], "hi");
    }
}
