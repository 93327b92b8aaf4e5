//! Moving one turn's question and answer over the network.
//!
//! Two transports share the same logical operation: [`StreamTransport`]
//! delivers the answer as ordered text deltas over a server-push channel,
//! [`UnaryTransport`] as one JSON response. Both convert every failure into a
//! classified [`ChatError`] at this boundary.

pub mod sse;
pub mod stream;
pub mod unary;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::FollowupMode;
use crate::error::ChatError;
use crate::events::ConversationId;

pub use stream::HttpStreamTransport;
pub use unary::HttpUnaryTransport;

/// Major and sub-field the question belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classifiers {
    pub major: String,
    pub sub_field: String,
}

/// Input of one streamed turn.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub question: String,
    pub classifiers: Classifiers,
    pub conversation_id: ConversationId,
}

/// Events of one stream, in delivery order.
///
/// At most one `Start`, then any number of `Delta`, then exactly one of
/// `Done` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Server-confirmed conversation id
    Start(ConversationId),
    /// Text fragment to append
    Delta(String),
    Done,
    Error(ChatError),
}

/// Receiving end of an opened stream plus its cancellation handle.
pub struct StreamSession {
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub handle: StreamHandle,
}

/// Cancels a stream. Dropping the handle cancels too.
pub struct StreamHandle {
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn new(cancelled: Arc<AtomicBool>, task: Option<JoinHandle<()>>) -> Self {
        Self { cancelled, task }
    }

    /// Stop delivery and release the connection. Idempotent.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Opens a server-push stream for one question.
pub trait StreamTransport: Send + Sync {
    /// Must be called from within a Tokio runtime.
    fn open(&self, request: StreamRequest) -> StreamSession;
}

/// Input of one single-shot turn.
#[derive(Debug, Clone)]
pub struct UnaryRequest {
    pub question: String,
    pub classifiers: Classifiers,
    pub conversation_id: Option<ConversationId>,
    pub followup_mode: FollowupMode,
    pub suggest_count: u8,
}

/// Validated single-shot answer.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryAnswer {
    pub answer_text: String,
    pub conversation_id: ConversationId,
    /// Follow-up questions embedded in the response, if the server sent any
    pub suggestions: Option<Vec<String>>,
}

/// Input of the suggestions-only call.
#[derive(Debug, Clone)]
pub struct SuggestionsRequest {
    pub conversation_id: ConversationId,
    pub classifiers: Classifiers,
    pub desired_count: u8,
}

#[async_trait]
pub trait UnaryTransport: Send + Sync {
    /// Send one question and wait for the whole answer.
    async fn ask(&self, request: UnaryRequest) -> Result<UnaryAnswer, ChatError>;

    /// Best effort: any failure yields an empty list.
    async fn suggestions(&self, request: SuggestionsRequest) -> Vec<String>;
}

/// Linear reconnect backoff: attempt `n` waits `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        Some(self.base_delay * attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Timing policy of the stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolicy {
    pub stall_timeout: Duration,
    pub max_duration: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(5),
            max_duration: Duration::from_secs(300),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Append `path` to the base URL's path.
pub(crate) fn endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(path.split('/'));
    }
    url
}
