//! Colloquy Voice - low-latency full-duplex voice dialogue engine
//!
//! Drives the path captured audio -> transcript -> language-model tokens ->
//! sentence-level synthesis -> audio chunks, with wake/interrupt detection
//! on transcripts, turn-scoped cancellation, a "no unsupported claims" gate
//! on replies, and back-pressured per-session event streams.
//!
//! Transcription, generation, and synthesis are capability ports; consumers
//! wire providers and a transport, the engine does the rest.

// Core modules
pub mod config;
pub mod events;
pub mod intake;
pub mod memory;
pub mod pipeline;
pub mod ports;
pub mod sentence;
pub mod session;
pub mod upstream;
pub mod verify;
pub mod wake;
pub mod watchdog;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use events::{ErrorCode, EventEnvelope, EventStream, SessionEvent};
pub use intake::{AudioBuffer, AudioFormat};
pub use memory::{Conversation, ConversationMemory, Message, Role};
pub use pipeline::{PipelineEngine, PipelineError, SessionInfo, TurnInput};
pub use ports::{
    AudioChunkStream, ContextProvider, MessageSink, PortError, ResponseGenerator,
    SpeechSynthesizer, StaticContext, TokenStream, Transcriber,
};
pub use sentence::SentenceSplitter;
pub use session::{InterruptReason, SessionState};
pub use upstream::{CircuitBreaker, RetryPolicy, TokenBucket, UpstreamError};
pub use verify::{
    Citation, Claim, ClaimType, ContextSnapshot, ReplyVerifier, VerificationReport,
    VerificationSummary, VerifyMode, DISCLAIMER,
};
pub use wake::{Trigger, TriggerKind, WakeWordDetector};
