//! Streaming chat client for a major-aware AI tutor service.
//!
//! [`ChatOrchestrator`] runs one question/answer turn at a time over a
//! server-push [`transport::StreamTransport`] or a single-shot
//! [`transport::UnaryTransport`], keeps the message history and publishes
//! every change as an [`OrchestratorUpdate`].

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod session;
pub mod storage;
pub mod suggestions;
pub mod transport;

pub use config::{Config, FollowupMode};
pub use error::{ChatError, ErrorKind, TimeoutCause};
pub use events::{
    ChatStatus, ConversationId, Message, MessageId, MessageRole, OrchestratorState,
    OrchestratorUpdate, SendOutcome, TurnId,
};
pub use orchestrator::{ChatOrchestrator, TurnEvent, TurnOptions};
pub use session::ConversationSession;
pub use storage::{ConversationStore, FileStore, MemoryStore};
