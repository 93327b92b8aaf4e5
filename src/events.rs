use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ChatError;

/// Opaque identifier of one logical conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Local token identifying one turn. Never sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// One request/response cycle
#[derive(Debug, Clone)]
pub struct Turn {
    pub turn_id: TurnId,
    pub question: String,
    pub submitted_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(question: String) -> Self {
        Self {
            turn_id: TurnId::new(),
            question,
            submitted_at: Utc::now(),
        }
    }
}

/// Role in conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Entry in the ordered history.
///
/// Only `text` and `suggestions` of the assistant message belonging to the
/// active turn ever change after it is appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: MessageId,
    pub role: MessageRole,
    pub text: String,
    pub suggestions: Vec<String>,
    pub turn_id: TurnId,
}

impl Message {
    pub fn user(turn: &Turn) -> Self {
        Self {
            message_id: MessageId::new(),
            role: MessageRole::User,
            text: turn.question.clone(),
            suggestions: Vec::new(),
            turn_id: turn.turn_id,
        }
    }

    /// Empty placeholder that the turn's answer is written into
    pub fn assistant_placeholder(turn: &Turn) -> Self {
        Self {
            message_id: MessageId::new(),
            role: MessageRole::Assistant,
            text: String::new(),
            suggestions: Vec::new(),
            turn_id: turn.turn_id,
        }
    }
}

/// Orchestrator lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChatStatus {
    #[default]
    Idle,
    Sending,
    Streaming,
    AwaitingSuggestions,
    Error,
}

impl ChatStatus {
    /// A primary answer is in flight; new sends are ignored.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ChatStatus::Sending | ChatStatus::Streaming)
    }
}

/// Everything the UI renders from.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorState {
    pub messages: Vec<Message>,
    pub status: ChatStatus,
    pub active_turn_id: Option<TurnId>,
    pub last_error: Option<ChatError>,
}

/// Changes published to observers, in the order they were applied.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorUpdate {
    StatusChanged(ChatStatus),
    MessageAppended(Message),
    /// Text fragment appended to a streaming answer
    TextAppended { message_id: MessageId, delta: String },
    /// Whole text of a message replaced
    TextReplaced { message_id: MessageId, text: String },
    MessageRemoved(MessageId),
    SuggestionsAttached {
        message_id: MessageId,
        suggestions: Vec<String>,
    },
    ConversationAdopted(ConversationId),
    ConversationRotated(ConversationId),
    TurnFailed { turn_id: TurnId, error: ChatError },
    /// Carries [`ChatError::Cancelled`]; never recorded as `last_error`
    TurnCancelled { turn_id: TurnId, error: ChatError },
    HistoryCleared,
}

/// Result of a `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A new turn started.
    Started(TurnId),
    /// Another turn was already in flight; nothing happened.
    Ignored,
}
