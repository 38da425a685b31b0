//! Pipeline engine - drives a session through one turn at a time
//!
//! A turn runs captured audio through transcription, the wake/interrupt
//! gate, streaming generation with sentence-level synthesis, and the
//! verification gate, publishing ordered events along the way. Turns across
//! sessions are independent; within a session they are serialized by an
//! async gate. The interrupt path deliberately bypasses that gate so a live
//! transcript or control message can cut a speaking session short.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{self, ErrorCode, EventPublisher, EventStream, SessionEvent};
use crate::intake::wav_wrap;
use crate::memory::{ConversationMemory, Message, Role};
use crate::ports::{
    ContextProvider, MessageSink, PortError, ResponseGenerator, SpeechSynthesizer, TokenStream,
    Transcriber,
};
use crate::sentence::SentenceSplitter;
use crate::session::{
    InterruptReason, SessionError, SessionState, SessionStore, SharedSession,
};
use crate::upstream::{CircuitBreaker, TokenBucket, UpstreamError, UpstreamGuard};
use crate::verify::{ReplyVerifier, VerificationReport};
use crate::wake::{extract_command_after_wake, TriggerKind, WakeWordDetector};
use crate::watchdog::TurnTimer;

/// How many trailing messages ride along as conversation context for the
/// verifier.
const VERIFY_CONVERSATION_WINDOW: usize = 6;

/// Ids handed back to the transport on attach.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub conversation_id: Uuid,
}

/// A user utterance entering the turn protocol.
#[derive(Debug)]
pub enum TurnInput {
    /// Raw PCM to be WAV-wrapped and transcribed.
    Audio(Vec<u8>),
    /// A transcript injected by a client that runs its own STT.
    Text(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Memory(#[from] crate::memory::MemoryError),
    #[error(transparent)]
    Events(#[from] crate::events::EventError),
}

struct EngineInner {
    config: EngineConfig,
    detector: WakeWordDetector,
    verifier: ReplyVerifier,
    sessions: SessionStore,
    memory: ConversationMemory,
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    context: Arc<dyn ContextProvider>,
    sink: parking_lot::RwLock<Option<Arc<dyn MessageSink>>>,
    publishers: parking_lot::RwLock<HashMap<Uuid, EventPublisher>>,
    turn_gates: parking_lot::RwLock<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    transcribe_guard: UpstreamGuard,
    generate_guard: UpstreamGuard,
    synthesize_guard: UpstreamGuard,
}

/// The voice engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

impl PipelineEngine {
    pub fn new(
        config: EngineConfig,
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        context: Arc<dyn ContextProvider>,
    ) -> Self {
        let detector = WakeWordDetector::new(
            &config.wake_phrases,
            &config.interrupt_phrases,
            config.wake_sensitivity,
            config.wake_debounce(),
        );
        let verifier = ReplyVerifier::new(config.verify_threshold, config.verify_mode);
        let guard = |name, timeout_ms| {
            UpstreamGuard::new(
                name,
                TokenBucket::new(
                    config.rate_limit_per_sec.max(1.0),
                    config.rate_limit_per_sec,
                ),
                CircuitBreaker::new(
                    config.breaker_failure_threshold,
                    Duration::from_millis(config.breaker_cooldown_ms),
                ),
                Duration::from_millis(timeout_ms),
                config.retry_policy(),
            )
        };

        Self {
            inner: Arc::new(EngineInner {
                detector,
                verifier,
                sessions: SessionStore::new(),
                memory: ConversationMemory::new(),
                transcriber,
                generator,
                synthesizer,
                context,
                sink: parking_lot::RwLock::new(None),
                publishers: parking_lot::RwLock::new(HashMap::new()),
                turn_gates: parking_lot::RwLock::new(HashMap::new()),
                transcribe_guard: guard("transcription", config.transcribe_timeout_ms),
                generate_guard: guard("generation", config.generate_timeout_ms),
                synthesize_guard: guard("synthesis", config.synthesize_timeout_ms),
                config,
            }),
        }
    }

    /// Attach the optional vector-store write-through port.
    pub fn with_message_sink(self, sink: Arc<dyn MessageSink>) -> Self {
        *self.inner.sink.write() = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.inner.memory
    }

    pub fn session_state(&self, session_id: Uuid) -> Result<SessionState, PipelineError> {
        Ok(self.inner.sessions.get(session_id)?.lock().state)
    }

    /// Create a session (and its conversation) for a freshly attached
    /// transport connection. The returned stream is the connection's ordered
    /// event feed; it must be drained or the session's turns will block.
    pub async fn create_session(
        &self,
        user_id: &str,
    ) -> Result<(SessionInfo, EventStream), PipelineError> {
        let conversation_id = self.inner.memory.create(user_id);
        let session_id = self.inner.sessions.create(user_id, conversation_id);

        let (publisher, stream) = events::channel(session_id, self.inner.config.event_buffer);
        self.inner.publishers.write().insert(session_id, publisher.clone());
        self.inner
            .turn_gates
            .write()
            .insert(session_id, Arc::new(tokio::sync::Mutex::new(())));

        publisher
            .emit(SessionEvent::SessionCreated {
                session_id,
                conversation_id,
            })
            .await?;

        Ok((
            SessionInfo {
                session_id,
                conversation_id,
            },
            stream,
        ))
    }

    /// Detach a session: cancels in-flight work and drops its event channel.
    /// The conversation stays in memory.
    pub async fn end_session(&self, session_id: Uuid) -> Result<(), PipelineError> {
        let session = self
            .inner
            .sessions
            .remove(session_id)
            .ok_or(SessionError::NotFound(session_id))?;
        {
            let mut session = session.lock();
            session.cancel_turn();
            session.clear_response();
            session.buffer.clear();
        }
        self.inner.publishers.write().remove(&session_id);
        self.inner.turn_gates.write().remove(&session_id);
        log::info!("[Pipeline] session {session_id} ended");
        Ok(())
    }

    /// Ingest one captured frame. Transitions `idle -> listening`; frames in
    /// every other state accumulate too - during `processing`/`speaking` they
    /// feed the interrupt probe, during `interrupted` the utterance that will
    /// resume the session.
    pub async fn on_audio_chunk(
        &self,
        session_id: Uuid,
        frame: &[u8],
    ) -> Result<(), PipelineError> {
        let session = self.inner.sessions.get(session_id)?;
        {
            let mut session = session.lock();
            if session.state == SessionState::Idle {
                session.transition(SessionState::Listening);
            }
            session.buffer.push(frame);
            session.touch();
        }

        self.publisher(session_id)?
            .emit(SessionEvent::AudioChunk {
                bytes: frame.len(),
                sample_rate: self.inner.config.sample_rate,
                channels: self.inner.config.channels,
            })
            .await?;
        Ok(())
    }

    /// Close the current utterance. Depending on state this either starts a
    /// turn, probes an active turn for interrupt words, or resumes an
    /// interrupted session. Returns the turn task when one was spawned.
    pub async fn on_audio_end(
        &self,
        session_id: Uuid,
    ) -> Result<Option<JoinHandle<()>>, PipelineError> {
        let session = self.inner.sessions.get(session_id)?;
        let (state, pcm) = {
            let mut session = session.lock();
            session.touch();
            (session.state, session.buffer.take())
        };

        self.publisher(session_id)?.emit(SessionEvent::AudioEnd).await?;

        let min_bytes = self.inner.config.min_utterance_bytes;
        if pcm.len() < min_bytes {
            log::debug!(
                "[Pipeline] discarding short utterance for {session_id} ({} < {min_bytes} bytes)",
                pcm.len()
            );
            if state == SessionState::Listening {
                session.lock().transition(SessionState::Idle);
            }
            return Ok(None);
        }

        Ok(self.dispatch_utterance(session_id, &session, state, TurnInput::Audio(pcm)))
    }

    /// Accept a client-side transcript, bypassing the transcription port.
    pub async fn on_transcript(
        &self,
        session_id: Uuid,
        text: &str,
        is_final: bool,
    ) -> Result<Option<JoinHandle<()>>, PipelineError> {
        let session = self.inner.sessions.get(session_id)?;
        session.lock().touch();

        if !is_final {
            self.publisher(session_id)?
                .emit(SessionEvent::TranscriptPartial {
                    text: text.to_string(),
                    is_final: false,
                    confidence: None,
                })
                .await?;
            return Ok(None);
        }

        let state = session.lock().state;
        Ok(self.dispatch_utterance(session_id, &session, state, TurnInput::Text(text.to_string())))
    }

    fn dispatch_utterance(
        &self,
        session_id: Uuid,
        session: &SharedSession,
        state: SessionState,
        input: TurnInput,
    ) -> Option<JoinHandle<()>> {
        match state {
            SessionState::Idle | SessionState::Listening => {
                {
                    let mut session = session.lock();
                    session.buffer.clear();
                    session.transition(SessionState::Processing);
                }
                let engine = self.clone();
                Some(tokio::spawn(async move {
                    engine.run_turn(session_id, input).await;
                }))
            }
            // An utterance completed while a turn is mid-flight: only an
            // interrupt word matters, queued audio is never replayed.
            SessionState::Processing | SessionState::Speaking => {
                let engine = self.clone();
                Some(tokio::spawn(async move {
                    engine.run_probe(session_id, input).await;
                }))
            }
            SessionState::Interrupted => {
                let engine = self.clone();
                Some(tokio::spawn(async move {
                    engine.run_turn(session_id, input).await;
                }))
            }
        }
    }

    /// Interrupt a session: transitions to `interrupted`, obsoletes all
    /// in-flight work for the active response, and emits `synthesis.stop`
    /// (when speaking) followed by `session.interrupted`. Returns false when
    /// nothing was interruptible; already-interrupted sessions are a no-op.
    pub async fn interrupt(
        &self,
        session_id: Uuid,
        reason: InterruptReason,
    ) -> Result<bool, PipelineError> {
        let session = self.inner.sessions.get(session_id)?;
        let was_speaking = match session.lock().interrupt() {
            Some(was_speaking) => was_speaking,
            None => return Ok(false),
        };

        log::info!(
            "[Pipeline] session {session_id} interrupted ({})",
            reason.as_str()
        );
        let publisher = self.publisher(session_id)?;
        if was_speaking {
            publisher.emit(SessionEvent::SynthesisStop).await?;
        }
        publisher
            .emit(SessionEvent::SessionInterrupted { reason })
            .await?;
        Ok(true)
    }

    /// Periodically end sessions whose inactivity exceeds the configured
    /// timeout.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let timeout = engine.inner.config.session_timeout();
            let period = (timeout / 4).max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for session_id in engine.inner.sessions.stale(timeout) {
                    log::info!("[Pipeline] reaping idle session {session_id}");
                    if let Ok(publisher) = engine.publisher(session_id) {
                        let _ = tokio::time::timeout(
                            Duration::from_secs(1),
                            publisher.emit(SessionEvent::SessionInterrupted {
                                reason: InterruptReason::Timeout,
                            }),
                        )
                        .await;
                    }
                    let _ = engine.end_session(session_id).await;
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Turn protocol
    // ------------------------------------------------------------------

    /// The interrupt probe: a transcript arriving while another turn owns
    /// the session. Runs outside the turn gate on purpose.
    async fn run_probe(&self, session_id: Uuid, input: TurnInput) {
        let text = match input {
            TurnInput::Text(text) => text,
            TurnInput::Audio(pcm) => match self.transcribe(pcm).await {
                Ok(text) => text,
                Err(err) => {
                    log::warn!("[Pipeline] probe transcription failed for {session_id}: {err}");
                    return;
                }
            },
        };
        if text.trim().is_empty() {
            return;
        }

        if let Some(trigger) = self.inner.detector.classify(&text) {
            if trigger.kind == TriggerKind::Interrupt {
                let _ = self.interrupt(session_id, InterruptReason::User).await;
                return;
            }
        }
        log::debug!("[Pipeline] dropping non-interrupt speech during active turn: '{text}'");
    }

    async fn run_turn(&self, session_id: Uuid, input: TurnInput) {
        let Some(gate) = self.turn_gate(session_id) else { return };
        let _turn = gate.lock().await;

        let Ok(session) = self.inner.sessions.get(session_id) else { return };
        let Ok(publisher) = self.publisher(session_id) else { return };
        let timer = TurnTimer::start(Duration::from_millis(self.inner.config.max_latency_ms));

        // 1. Transcribe
        let transcript = match input {
            TurnInput::Text(text) => text,
            TurnInput::Audio(pcm) => match self.transcribe(pcm).await {
                Ok(text) => text,
                Err(err) => {
                    let (code, recoverable) =
                        classify_upstream(&err, ErrorCode::TranscriptionFailed);
                    let _ = publisher
                        .emit(SessionEvent::Error {
                            code,
                            message: err.to_string(),
                            recoverable,
                        })
                        .await;
                    settle_idle(&session);
                    return;
                }
            },
        };
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            settle_idle(&session);
            return;
        }

        // 2. Wake / interrupt gate
        let entry_state = session.lock().state;
        let trigger = self.inner.detector.classify(&transcript);
        let input_text = match entry_state {
            SessionState::Interrupted => match trigger {
                Some(t) if t.kind == TriggerKind::Interrupt => {
                    // Still interrupted; the utterance is consumed.
                    let _ = self.emit_transcript(&publisher, &transcript).await;
                    return;
                }
                Some(t) => {
                    let tail = extract_command_after_wake(&transcript, &t.matched);
                    if tail.is_empty() {
                        // Awake but nothing asked yet: wait for the next
                        // utterance.
                        let _ = self.emit_transcript(&publisher, &transcript).await;
                        return;
                    }
                    session.lock().transition(SessionState::Processing);
                    tail
                }
                None => {
                    // A plain utterance resumes the dialogue verbatim.
                    session.lock().transition(SessionState::Processing);
                    transcript.clone()
                }
            },
            _ => match trigger {
                Some(t) if t.kind == TriggerKind::Wake => {
                    let tail = extract_command_after_wake(&transcript, &t.matched);
                    if tail.is_empty() {
                        let _ = self.emit_transcript(&publisher, &transcript).await;
                        settle_idle(&session);
                        return;
                    }
                    tail
                }
                // A fresh utterance that happens to contain an interrupt
                // word has nothing to interrupt; it is ordinary input.
                _ => transcript.clone(),
            },
        };

        // 3. Publish the transcript and remember what the user asked
        if self.emit_transcript(&publisher, &transcript).await.is_err() {
            settle_idle(&session);
            return;
        }
        let conversation_id = session.lock().conversation_id;
        match self
            .inner
            .memory
            .append(conversation_id, Message::new(Role::User, input_text))
        {
            Ok(stored) => self.mirror(conversation_id, stored),
            Err(err) => log::error!("[Pipeline] user append failed: {err}"),
        }

        // 4. Mint the response id; everything downstream carries it
        let (response_id, cancel) = session.lock().begin_response();

        // 5. Begin generation
        if publisher.emit(SessionEvent::GenerationStart).await.is_err() {
            settle_idle(&session);
            return;
        }
        let history = self
            .inner
            .memory
            .messages(conversation_id)
            .unwrap_or_default();
        let snapshot = self.inner.context.snapshot();
        // The connect itself must honor the turn's cancellation signal; an
        // interrupt landing here abandons the upstream transfer outright.
        let connect = tokio::select! {
            _ = cancel.cancelled() => {
                timer.finish(session_id);
                return;
            }
            connect = self.inner.generate_guard.run_once(|| {
                self.inner
                    .generator
                    .generate_stream(&history, &snapshot, cancel.clone())
            }) => connect,
        };
        let stream = match connect {
            Ok(stream) => stream,
            Err(err) => {
                let (code, recoverable) = classify_upstream(&err, ErrorCode::GenerationFailed);
                let _ = publisher
                    .emit(SessionEvent::Error {
                        code,
                        message: err.to_string(),
                        recoverable,
                    })
                    .await;
                settle_idle(&session);
                return;
            }
        };

        // 6-7. Token pump with sentence-serialized synthesis
        let pump = self
            .pump_reply(&session, &publisher, response_id, &cancel, stream)
            .await;
        let (full_reply, spoke) = match pump {
            PumpOutcome::Completed { text, spoke } => (text, spoke),
            PumpOutcome::Cancelled => {
                timer.finish(session_id);
                return;
            }
            PumpOutcome::Failed => {
                settle_idle(&session);
                timer.finish(session_id);
                return;
            }
        };

        // 8. Verify and commit the reply
        let verification = if self.inner.config.verify_enabled && !full_reply.trim().is_empty() {
            let mut verify_snapshot = snapshot;
            verify_snapshot.conversation = self
                .inner
                .memory
                .recent(conversation_id, VERIFY_CONVERSATION_WINDOW);
            self.inner
                .verifier
                .verify(
                    &full_reply,
                    &verify_snapshot,
                    Some(self.inner.generator.as_ref()),
                )
                .await
        } else {
            VerificationReport::passthrough()
        };

        let final_text = verification
            .rewritten
            .clone()
            .unwrap_or_else(|| full_reply.clone());
        for warning in &verification.warnings {
            log::warn!("[Verify] {session_id}: {warning}");
        }
        if verification.degraded {
            let _ = publisher
                .emit(SessionEvent::Error {
                    code: ErrorCode::VerificationUnavailable,
                    message: "Model-backed verification unavailable, rule-based verdict used"
                        .to_string(),
                    recoverable: true,
                })
                .await;
        }

        if !session_live(&session, response_id) {
            timer.finish(session_id);
            return;
        }
        if !final_text.trim().is_empty() {
            let message = Message::new(Role::Assistant, final_text.clone())
                .with_citations(verification.citations.clone());
            match self.inner.memory.append(conversation_id, message) {
                Ok(stored) => self.mirror(conversation_id, stored),
                Err(err) => log::error!("[Pipeline] assistant append failed: {err}"),
            }
        }
        let _ = publisher
            .emit_guarded(
                SessionEvent::GenerationEnd {
                    text: final_text,
                    verification: verification.summary(),
                },
                || session_live(&session, response_id),
            )
            .await;

        // 9. Finalize
        if spoke {
            let _ = publisher
                .emit_guarded(SessionEvent::SynthesisEnd, || {
                    session_live(&session, response_id)
                })
                .await;
        }
        {
            let mut session = session.lock();
            if session.active_response_id == Some(response_id) {
                session.transition(SessionState::Idle);
                session.clear_response();
            }
        }
        timer.finish(session_id);
    }

    async fn pump_reply(
        &self,
        session: &SharedSession,
        publisher: &EventPublisher,
        response_id: Uuid,
        cancel: &CancellationToken,
        mut stream: TokenStream,
    ) -> PumpOutcome {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.inner.config.generate_timeout_ms);
        let mut splitter = SentenceSplitter::new();
        let mut full_reply = String::new();
        let mut spoke = false;

        loop {
            if !session_live(session, response_id) {
                return PumpOutcome::Cancelled;
            }

            // Stop consuming the moment the turn is cancelled; a token that
            // is already in flight is simply never read.
            let next = tokio::select! {
                _ = cancel.cancelled() => return PumpOutcome::Cancelled,
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            let token = match next {
                Err(_) => {
                    let _ = publisher
                        .emit(SessionEvent::Error {
                            code: ErrorCode::Timeout,
                            message: format!(
                                "Generation exceeded {}ms",
                                self.inner.config.generate_timeout_ms
                            ),
                            recoverable: true,
                        })
                        .await;
                    return PumpOutcome::Failed;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    // Streaming has begun; retry is unsafe. Partial audio
                    // already emitted stays with the transport.
                    let _ = publisher
                        .emit(SessionEvent::Error {
                            code: ErrorCode::GenerationFailed,
                            message: err.to_string(),
                            recoverable: true,
                        })
                        .await;
                    return PumpOutcome::Failed;
                }
                Ok(Some(Ok(token))) => token,
            };

            full_reply.push_str(&token);
            match publisher
                .emit_guarded(SessionEvent::GenerationChunk { token: token.clone() }, || {
                    session_live(session, response_id)
                })
                .await
            {
                Ok(true) => {}
                Ok(false) | Err(_) => return PumpOutcome::Cancelled,
            }

            for sentence in splitter.push(&token) {
                if !self
                    .speak_sentence(session, publisher, response_id, cancel, &sentence, &mut spoke)
                    .await
                {
                    return PumpOutcome::Cancelled;
                }
            }
        }

        // Flush the unterminated tail as the final sentence
        if let Some(tail) = splitter.flush() {
            if !self
                .speak_sentence(session, publisher, response_id, cancel, &tail, &mut spoke)
                .await
            {
                return PumpOutcome::Cancelled;
            }
        }

        PumpOutcome::Completed {
            text: full_reply,
            spoke,
        }
    }

    /// Synthesize one sentence and relay its chunks. Sentences are strictly
    /// serialized: the next one starts only after this call returns, which
    /// is what keeps audio ordered and back-pressure flowing. Returns false
    /// when the turn has died; per-sentence upstream failures are swallowed.
    async fn speak_sentence(
        &self,
        session: &SharedSession,
        publisher: &EventPublisher,
        response_id: Uuid,
        cancel: &CancellationToken,
        sentence: &str,
        spoke: &mut bool,
    ) -> bool {
        if cancel.is_cancelled() || !session_live(session, response_id) {
            return false;
        }

        if !*spoke {
            {
                let mut session = session.lock();
                if !session.is_live(response_id) {
                    return false;
                }
                session.transition(SessionState::Speaking);
            }
            match publisher
                .emit_guarded(SessionEvent::SynthesisStart, || {
                    session_live(session, response_id)
                })
                .await
            {
                Ok(true) => *spoke = true,
                Ok(false) | Err(_) => return false,
            }
        }

        let connect = tokio::select! {
            _ = cancel.cancelled() => return false,
            connect = self.inner.synthesize_guard.run(|| {
                self.inner
                    .synthesizer
                    .synthesize_stream(sentence, cancel.clone())
            }) => connect,
        };
        let mut chunks = match connect {
            Ok(chunks) => chunks,
            Err(err) => {
                // Non-fatal to the turn: the reply text remains valid.
                log::warn!("[Pipeline] synthesis failed for one sentence, continuing: {err}");
                let _ = publisher
                    .emit_guarded(
                        SessionEvent::Error {
                            code: ErrorCode::SynthesisFailed,
                            message: err.to_string(),
                            recoverable: true,
                        },
                        || session_live(session, response_id),
                    )
                    .await;
                return true;
            }
        };

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return false,
                chunk = chunks.next() => chunk,
            };
            match chunk {
                None => return true,
                Some(Err(err)) => {
                    log::warn!("[Pipeline] synthesis stream broke mid-sentence: {err}");
                    return true;
                }
                Some(Ok(audio)) => {
                    match publisher
                        .emit_guarded(SessionEvent::SynthesisChunk { audio }, || {
                            session_live(session, response_id)
                        })
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) | Err(_) => return false,
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn transcribe(&self, pcm: Vec<u8>) -> Result<String, UpstreamError> {
        let wav = wav_wrap(&pcm, self.inner.config.audio_format());
        self.inner
            .transcribe_guard
            .run(|| self.inner.transcriber.transcribe(&wav))
            .await
    }

    async fn emit_transcript(
        &self,
        publisher: &EventPublisher,
        transcript: &str,
    ) -> Result<(), crate::events::EventError> {
        publisher
            .emit(SessionEvent::TranscriptFinal {
                text: transcript.to_string(),
                is_final: true,
                confidence: None,
            })
            .await
    }

    /// Forward an appended message to the vector-store port without blocking
    /// the turn. Failures are logged, never propagated.
    fn mirror(&self, conversation_id: Uuid, message: Message) {
        let Some(sink) = self.inner.sink.read().clone() else { return };
        tokio::spawn(async move {
            if let Err(err) = sink.store(conversation_id, &message).await {
                log::warn!("[Memory] write-through failed for {conversation_id}: {err}");
            }
        });
    }

    fn publisher(&self, session_id: Uuid) -> Result<EventPublisher, SessionError> {
        self.inner
            .publishers
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::NotFound(session_id))
    }

    fn turn_gate(&self, session_id: Uuid) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.inner.turn_gates.read().get(&session_id).cloned()
    }
}

enum PumpOutcome {
    Completed { text: String, spoke: bool },
    Cancelled,
    Failed,
}

fn session_live(session: &SharedSession, response_id: Uuid) -> bool {
    session.lock().is_live(response_id)
}

fn settle_idle(session: &SharedSession) {
    let mut session = session.lock();
    if matches!(
        session.state,
        SessionState::Processing | SessionState::Speaking
    ) {
        session.transition(SessionState::Idle);
        session.clear_response();
    }
}

fn classify_upstream(err: &UpstreamError, fallback: ErrorCode) -> (ErrorCode, bool) {
    let code = match err {
        UpstreamError::CircuitOpen(_) => ErrorCode::UpstreamCircuitOpen,
        UpstreamError::Port(PortError::Timeout(_)) => ErrorCode::Timeout,
        UpstreamError::Port(_) => fallback,
    };
    (code, code.recoverable())
}
