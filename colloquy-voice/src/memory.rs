//! Conversation memory - per-conversation append-only message log
//!
//! The log is the generator's context and the durable record of a dialogue.
//! It is kept in memory for the engine; mirroring to an external vector
//! store happens through the `MessageSink` port and never blocks a turn.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::verify::Citation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            created_at: Utc::now(),
            citations: Vec::new(),
        }
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-process conversation registry. A conversation is shared 1:1 with a
/// session while that session lives, and may outlive it.
#[derive(Default)]
pub struct ConversationMemory {
    conversations: RwLock<HashMap<Uuid, Conversation>>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user_id: &str) -> Uuid {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let id = conversation.id;
        self.conversations.write().insert(id, conversation);
        id
    }

    /// Append a message in generation order. Returns the stored message so
    /// callers can forward it to the write-through port.
    pub fn append(&self, conversation_id: Uuid, message: Message) -> Result<Message, MemoryError> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or(MemoryError::UnknownConversation(conversation_id))?;
        conversation.messages.push(message.clone());
        conversation.updated_at = message.created_at;
        Ok(message)
    }

    pub fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, MemoryError> {
        self.conversations
            .read()
            .get(&conversation_id)
            .map(|c| c.messages.clone())
            .ok_or(MemoryError::UnknownConversation(conversation_id))
    }

    /// The most recent `count` messages, oldest first.
    pub fn recent(&self, conversation_id: Uuid, count: usize) -> Vec<Message> {
        self.conversations
            .read()
            .get(&conversation_id)
            .map(|c| {
                let skip = c.messages.len().saturating_sub(count);
                c.messages[skip..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn message_count(&self, conversation_id: Uuid) -> usize {
        self.conversations
            .read()
            .get(&conversation_id)
            .map(|c| c.messages.len())
            .unwrap_or(0)
    }

    pub fn remove(&self, conversation_id: Uuid) -> Option<Conversation> {
        self.conversations.write().remove(&conversation_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Unknown conversation: {0}")]
    UnknownConversation(Uuid),
}
