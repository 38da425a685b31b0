//! Session store - live session registry, state machine, and reaping
//!
//! Every read and write of a session's mutable fields is serialized behind
//! that session's own lock; the store lock only guards the id map. Locks are
//! never held across await points.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::intake::AudioBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Interrupted,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptReason {
    User,
    Timeout,
    Error,
}

impl InterruptReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// One live client attachment.
pub struct Session {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub active_response_id: Option<Uuid>,
    pub buffer: AudioBuffer,
    last_activity: Instant,
    cancel: CancellationToken,
}

impl Session {
    fn new(user_id: &str, conversation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            user_id: user_id.to_string(),
            state: SessionState::Idle,
            started_at: Utc::now(),
            active_response_id: None,
            buffer: AudioBuffer::new(),
            last_activity: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn transition(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("[Session] {} {} -> {}", self.id, self.state.as_str(), state.as_str());
        }
        self.state = state;
        self.touch();
    }

    /// Mint a fresh response id and cancellation token for a new generation.
    /// At most one response id is active per session.
    pub fn begin_response(&mut self) -> (Uuid, CancellationToken) {
        let response_id = Uuid::new_v4();
        self.active_response_id = Some(response_id);
        self.cancel = CancellationToken::new();
        self.touch();
        (response_id, self.cancel.clone())
    }

    pub fn clear_response(&mut self) {
        self.active_response_id = None;
    }

    /// Whether work minted under `response_id` may still produce side effects.
    pub fn is_live(&self, response_id: Uuid) -> bool {
        self.active_response_id == Some(response_id) && self.state != SessionState::Interrupted
    }

    /// Transition to `interrupted` if a turn is in flight. Rotates the active
    /// response id (obsoleting all queued work) and cancels the turn token.
    /// Returns whether the session was speaking, or `None` when nothing was
    /// interruptible (already interrupted, idle, or listening).
    pub fn interrupt(&mut self) -> Option<bool> {
        match self.state {
            SessionState::Processing | SessionState::Speaking => {
                let was_speaking = self.state == SessionState::Speaking;
                self.transition(SessionState::Interrupted);
                self.active_response_id = None;
                self.buffer.clear();
                self.cancel.cancel();
                Some(was_speaking)
            }
            _ => None,
        }
    }

    pub fn cancel_turn(&self) {
        self.cancel.cancel();
    }
}

/// Process-wide mapping from session id to live session.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user_id: &str, conversation_id: Uuid) -> Uuid {
        let session = Session::new(user_id, conversation_id);
        let id = session.id;
        self.sessions.write().insert(id, Arc::new(Mutex::new(session)));
        log::info!("[Session] created {id} (conversation {conversation_id})");
        id
    }

    pub fn get(&self, session_id: Uuid) -> Result<SharedSession, SessionError> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::NotFound(session_id))
    }

    pub fn remove(&self, session_id: Uuid) -> Option<SharedSession> {
        self.sessions.write().remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Ids of sessions whose last activity is older than `older_than`.
    /// Taken as a snapshot; the reaper ends them one by one.
    pub fn stale(&self, older_than: Duration) -> Vec<Uuid> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, session)| session.lock().idle_for() > older_than)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> (SessionStore, Uuid) {
        let store = SessionStore::new();
        let id = store.create("user-1", Uuid::new_v4());
        (store, id)
    }

    #[test]
    fn created_session_starts_idle() {
        let (store, id) = store_with_session();
        let session = store.get(id).unwrap();
        let session = session.lock();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.active_response_id.is_none());
    }

    #[test]
    fn interrupt_only_fires_from_processing_or_speaking() {
        let (store, id) = store_with_session();
        let session = store.get(id).unwrap();

        assert!(session.lock().interrupt().is_none());

        session.lock().transition(SessionState::Listening);
        assert!(session.lock().interrupt().is_none());

        session.lock().transition(SessionState::Processing);
        assert_eq!(session.lock().interrupt(), Some(false));
        assert_eq!(session.lock().state, SessionState::Interrupted);

        // Idempotent: already interrupted
        assert!(session.lock().interrupt().is_none());
    }

    #[test]
    fn interrupt_obsoletes_active_response() {
        let (store, id) = store_with_session();
        let session = store.get(id).unwrap();

        session.lock().transition(SessionState::Processing);
        let (response_id, cancel) = session.lock().begin_response();
        session.lock().transition(SessionState::Speaking);
        assert!(session.lock().is_live(response_id));

        assert_eq!(session.lock().interrupt(), Some(true));
        assert!(!session.lock().is_live(response_id));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn begin_response_replaces_previous_id() {
        let (store, id) = store_with_session();
        let session = store.get(id).unwrap();

        let (first, _) = session.lock().begin_response();
        let (second, _) = session.lock().begin_response();
        assert_ne!(first, second);
        assert!(!session.lock().is_live(first));
        assert!(session.lock().is_live(second));
    }

    #[test]
    fn stale_snapshot_finds_idle_sessions() {
        let (store, id) = store_with_session();
        assert!(store.stale(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(store.stale(Duration::from_millis(1)), vec![id]);
    }

    #[test]
    fn missing_session_is_an_error() {
        let store = SessionStore::new();
        assert!(matches!(
            store.get(Uuid::new_v4()),
            Err(SessionError::NotFound(_))
        ));
    }
}
