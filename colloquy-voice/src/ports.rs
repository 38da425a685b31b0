//! Capability ports - the three upstream interfaces the engine consumes,
//! plus the context accessor and the write-through message sink
//!
//! Provider specifics live behind these traits; the engine only cares about
//! the contracts: transcription may fail and is retryable, generation is
//! retryable only before the first token, synthesis streams chunks and is
//! cancellable mid-transfer. Dropping a returned stream abandons the
//! transfer; the cancellation token lets implementations abort eagerly.

use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::memory::Message;
use crate::verify::ContextSnapshot;

/// Lazily produced language-model tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, PortError>> + Send>>;

/// Synthesized audio, chunked for streaming playback.
pub type AudioChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, PortError>> + Send>>;

/// Speech-to-text upstream. Input is a complete WAV-wrapped utterance.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav_bytes: &[u8]) -> Result<String, PortError>;
}

/// Streaming language-model upstream.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate_stream(
        &self,
        messages: &[Message],
        context: &ContextSnapshot,
        cancel: CancellationToken,
    ) -> Result<TokenStream, PortError>;
}

/// Streaming text-to-speech upstream.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize_stream(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<AudioChunkStream, PortError>;
}

/// Read-only accessor over the currently cached external-API data. Refresh
/// cadence is not the engine's concern; each snapshot is treated as
/// immutable for the duration of one call.
pub trait ContextProvider: Send + Sync {
    fn snapshot(&self) -> ContextSnapshot;
}

/// Write-through port toward an external vector store. Called off the
/// critical path after each successful conversation append; failures are
/// logged and never block a turn.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn store(&self, conversation_id: Uuid, message: &Message) -> Result<(), PortError>;
}

/// A fixed snapshot, for transports without a live context feed and for
/// tests.
#[derive(Default)]
pub struct StaticContext {
    snapshot: ContextSnapshot,
}

impl StaticContext {
    pub fn new(snapshot: ContextSnapshot) -> Self {
        Self { snapshot }
    }
}

impl ContextProvider for StaticContext {
    fn snapshot(&self) -> ContextSnapshot {
        self.snapshot.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Upstream returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Timed out after {0}ms")]
    Timeout(u64),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Invalid upstream payload: {0}")]
    InvalidPayload(String),
}

impl PortError {
    /// Whether a retry could plausibly succeed (5xx, 429, transport faults,
    /// timeouts). Cancellations and malformed payloads are final.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Cancelled | Self::InvalidPayload(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_status_class() {
        assert!(PortError::Status { status: 500, message: String::new() }.retryable());
        assert!(PortError::Status { status: 429, message: String::new() }.retryable());
        assert!(!PortError::Status { status: 400, message: String::new() }.retryable());
        assert!(PortError::Transport("reset".into()).retryable());
        assert!(PortError::Timeout(30_000).retryable());
        assert!(!PortError::Cancelled.retryable());
        assert!(!PortError::InvalidPayload("not json".into()).retryable());
    }
}
