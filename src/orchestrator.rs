//! Turn state machine: send → receive → suggestions → settle.
//!
//! All state lives in [`ChatOrchestrator`] and is only mutated through
//! `&mut self`, so the orchestration logic runs on one logical thread. Network
//! work happens in spawned tasks whose results come back through
//! [`ChatOrchestrator::next_event`]; every result is tagged with the turn that
//! produced it and is dropped if that turn is no longer the active one.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, FollowupMode};
use crate::error::{ChatError, ErrorKind, FALLBACK_ANSWER, TimeoutCause};
use crate::events::{
    ChatStatus, ConversationId, Message, MessageId, MessageRole, OrchestratorState,
    OrchestratorUpdate, SendOutcome, Turn, TurnId,
};
use crate::session::ConversationSession;
use crate::suggestions;
use crate::transport::{
    Classifiers, HttpStreamTransport, HttpUnaryTransport, StreamEvent, StreamRequest,
    StreamSession, StreamTransport, SuggestionsRequest, UnaryAnswer, UnaryRequest,
    UnaryTransport,
};

/// Longest accepted question, in characters.
pub const MAX_QUESTION_CHARS: usize = 1000;

const UPDATE_CAPACITY: usize = 256;

/// Per-orchestrator turn settings.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub classifiers: Classifiers,
    pub followup_mode: FollowupMode,
    pub suggest_count: u8,
    /// Prefer the stream transport when one is available
    pub streaming: bool,
    /// Re-issue a stalled stream over the unary transport
    pub fallback_on_stall: bool,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            classifiers: Classifiers::default(),
            followup_mode: FollowupMode::Multi,
            suggest_count: 3,
            streaming: true,
            fallback_on_stall: false,
        }
    }
}

impl From<&Config> for TurnOptions {
    fn from(config: &Config) -> Self {
        Self {
            classifiers: config.classifiers(),
            followup_mode: config.followup_mode,
            suggest_count: config.desired_suggestions(),
            streaming: config.streaming,
            fallback_on_stall: config.fallback_on_stall,
        }
    }
}

/// Asynchronous result delivered to the state machine for one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Stream(StreamEvent),
    Unary(Result<UnaryAnswer, ChatError>),
    Suggestions(Vec<String>),
}

/// What the active turn is waiting on.
enum Pending {
    Stream(StreamSession),
    Unary(JoinHandle<Result<UnaryAnswer, ChatError>>),
    Suggestions(JoinHandle<Vec<String>>),
    Nothing,
}

impl Pending {
    fn abort(&mut self) {
        match std::mem::replace(self, Pending::Nothing) {
            Pending::Stream(mut session) => session.handle.cancel(),
            Pending::Unary(task) => task.abort(),
            Pending::Suggestions(task) => task.abort(),
            Pending::Nothing => {}
        }
    }
}

struct ActiveTurn {
    turn: Turn,
    assistant_id: MessageId,
    pending: Pending,
    received_delta: bool,
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        self.pending.abort();
    }
}

/// Drives chat turns over the stream and unary transports.
pub struct ChatOrchestrator {
    options: TurnOptions,
    session: ConversationSession,
    unary: Arc<dyn UnaryTransport>,
    stream: Option<Arc<dyn StreamTransport>>,
    state: OrchestratorState,
    active: Option<ActiveTurn>,
    updates: broadcast::Sender<OrchestratorUpdate>,
}

impl ChatOrchestrator {
    pub fn new(
        options: TurnOptions,
        session: ConversationSession,
        unary: Arc<dyn UnaryTransport>,
        stream: Option<Arc<dyn StreamTransport>>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            options,
            session,
            unary,
            stream,
            state: OrchestratorState::default(),
            active: None,
            updates,
        }
    }

    /// Build the HTTP transports described by `config`.
    pub fn from_config(config: &Config, session: ConversationSession) -> anyhow::Result<Self> {
        let base_url = config.base_url()?;
        let unary = HttpUnaryTransport::new(base_url.clone(), config.request_timeout())?;
        let stream: Option<Arc<dyn StreamTransport>> = if config.streaming {
            Some(Arc::new(HttpStreamTransport::new(base_url, config.stream_policy())?))
        } else {
            None
        };
        Ok(Self::new(TurnOptions::from(config), session, Arc::new(unary), stream))
    }

    /// Receive every update applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorUpdate> {
        self.updates.subscribe()
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.state.messages
    }

    pub fn status(&self) -> ChatStatus {
        self.state.status
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.state.last_error.as_ref()
    }

    pub fn conversation_id(&mut self) -> ConversationId {
        self.session.get()
    }

    /// Whether a primary answer is in flight.
    pub fn is_busy(&self) -> bool {
        self.state.status.is_in_flight()
    }

    /// Start a turn for `question`.
    ///
    /// Ignored while another answer is in flight. Returns immediately after
    /// the user message and an empty assistant placeholder are appended; the
    /// answer arrives through [`next_event`](Self::next_event). Must be called
    /// from within a Tokio runtime.
    pub fn send(&mut self, question: &str) -> Result<SendOutcome, ChatError> {
        if self.is_busy() {
            debug!("Turn already in flight, ignoring send");
            return Ok(SendOutcome::Ignored);
        }
        let question = validate_question(question)?;

        // A turn still waiting on suggestions is superseded.
        if let Some(previous) = self.active.take() {
            debug!(turn_id = %previous.turn.turn_id, "superseding turn");
        }

        let turn = Turn::new(question);
        let turn_id = turn.turn_id;
        let user = Message::user(&turn);
        let assistant = Message::assistant_placeholder(&turn);
        let assistant_id = assistant.message_id;
        self.push_message(user);
        self.push_message(assistant);

        self.state.active_turn_id = Some(turn_id);
        self.state.last_error = None;
        self.set_status(ChatStatus::Sending);

        let conversation_id = self.session.get();
        let pending = match (&self.stream, self.options.streaming) {
            (Some(stream), true) => Pending::Stream(stream.open(StreamRequest {
                question: turn.question.clone(),
                classifiers: self.options.classifiers.clone(),
                conversation_id,
            })),
            _ => self.spawn_unary(&turn.question, conversation_id),
        };
        info!(%turn_id, "turn started");

        self.active = Some(ActiveTurn {
            turn,
            assistant_id,
            pending,
            received_delta: false,
        });
        self.set_status(ChatStatus::Streaming);
        Ok(SendOutcome::Started(turn_id))
    }

    /// Abort the in-flight answer, keeping any partial text.
    ///
    /// Returns `false` when nothing was in flight.
    pub fn cancel(&mut self) -> bool {
        if !self.is_busy() {
            return false;
        }
        if let Some(mut active) = self.active.take() {
            active.pending.abort();
            info!(turn_id = %active.turn.turn_id, "turn cancelled");
            self.emit(OrchestratorUpdate::TurnCancelled {
                turn_id: active.turn.turn_id,
                error: ChatError::Cancelled,
            });
        }
        self.state.active_turn_id = None;
        self.set_status(ChatStatus::Idle);
        true
    }

    /// Send the most recent user question again.
    pub fn retry(&mut self) -> Result<SendOutcome, ChatError> {
        if self.is_busy() {
            return Ok(SendOutcome::Ignored);
        }
        let question = self
            .state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text.clone())
            .ok_or_else(|| ChatError::InputInvalid("there is no question to retry".to_string()))?;
        self.send(&question)
    }

    /// Clear history and start a new conversation.
    pub fn reset(&mut self) {
        self.active = None;
        self.state.messages.clear();
        self.state.active_turn_id = None;
        self.state.last_error = None;
        self.emit(OrchestratorUpdate::HistoryCleared);

        let id = self.session.rotate();
        self.emit(OrchestratorUpdate::ConversationRotated(id));
        self.set_status(ChatStatus::Idle);
    }

    /// Abort any active turn and release its transport.
    pub fn shutdown(&mut self) {
        if self.active.take().is_some() {
            self.state.active_turn_id = None;
            self.set_status(ChatStatus::Idle);
        }
    }

    /// Wait for and apply the next result of the active turn.
    ///
    /// Returns `false` when no turn has outstanding work. Cancel-safe: if the
    /// returned future is dropped, no result is lost.
    pub async fn next_event(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let turn_id = active.turn.turn_id;

        let event = match &mut active.pending {
            Pending::Stream(session) => match session.events.recv().await {
                Some(event) => TurnEvent::Stream(event),
                None => TurnEvent::Stream(StreamEvent::Error(ChatError::NetworkUnavailable(
                    "stream ended without a result".to_string(),
                ))),
            },
            Pending::Unary(task) => {
                let result = task.await;
                active.pending = Pending::Nothing;
                TurnEvent::Unary(result.unwrap_or_else(|e| {
                    Err(ChatError::NetworkUnavailable(format!("request task failed: {e}")))
                }))
            }
            Pending::Suggestions(task) => {
                let result = task.await;
                active.pending = Pending::Nothing;
                TurnEvent::Suggestions(result.unwrap_or_default())
            }
            Pending::Nothing => return false,
        };

        self.handle_event(turn_id, event);
        true
    }

    /// Apply results until the active turn settles.
    pub async fn settle(&mut self) {
        while self.next_event().await {}
    }

    /// Apply one result for `turn_id`. Results for a superseded turn are ignored.
    pub fn handle_event(&mut self, turn_id: TurnId, event: TurnEvent) {
        if self.state.active_turn_id != Some(turn_id) {
            debug!(%turn_id, "dropping event for stale turn");
            return;
        }

        match event {
            TurnEvent::Stream(StreamEvent::Start(id)) => self.adopt_conversation(id),
            TurnEvent::Stream(StreamEvent::Delta(text)) => self.append_delta(text),
            TurnEvent::Stream(StreamEvent::Done) => {
                self.release_stream();
                self.complete_answer(None);
            }
            TurnEvent::Stream(StreamEvent::Error(err)) => {
                self.release_stream();
                if self.should_fall_back(&err) {
                    info!(%turn_id, "stream stalled, falling back to single request");
                    self.fall_back_to_unary();
                } else {
                    self.fail_turn(err);
                }
            }
            TurnEvent::Unary(Ok(answer)) => {
                self.adopt_conversation(answer.conversation_id);
                self.replace_answer_text(answer.answer_text);
                self.complete_answer(answer.suggestions);
            }
            TurnEvent::Unary(Err(err)) if err.kind() == ErrorKind::MalformedResponse => {
                warn!(%turn_id, "malformed answer: {err}");
                self.replace_answer_text(FALLBACK_ANSWER.to_string());
                self.state.last_error = Some(err);
                self.finish_turn();
            }
            TurnEvent::Unary(Err(err)) => self.fail_turn(err),
            TurnEvent::Suggestions(raw) => {
                self.attach_suggestions(raw);
                self.finish_turn();
            }
        }
    }

    fn spawn_unary(&self, question: &str, conversation_id: ConversationId) -> Pending {
        let unary = self.unary.clone();
        let request = UnaryRequest {
            question: question.to_string(),
            classifiers: self.options.classifiers.clone(),
            conversation_id: Some(conversation_id),
            followup_mode: self.options.followup_mode,
            suggest_count: self.options.suggest_count,
        };
        Pending::Unary(tokio::spawn(async move { unary.ask(request).await }))
    }

    fn spawn_suggestions(&mut self) -> Pending {
        let unary = self.unary.clone();
        let request = SuggestionsRequest {
            conversation_id: self.session.get(),
            classifiers: self.options.classifiers.clone(),
            desired_count: self.options.suggest_count,
        };
        Pending::Suggestions(tokio::spawn(async move { unary.suggestions(request).await }))
    }

    fn should_fall_back(&self, err: &ChatError) -> bool {
        self.options.fallback_on_stall
            && *err == ChatError::Timeout(TimeoutCause::Stall)
            && self.active.as_ref().is_some_and(|a| !a.received_delta)
    }

    fn fall_back_to_unary(&mut self) {
        let Some(question) = self.active.as_ref().map(|a| a.turn.question.clone()) else {
            return;
        };
        let conversation_id = self.session.get();
        let pending = self.spawn_unary(&question, conversation_id);
        if let Some(active) = self.active.as_mut() {
            active.pending = pending;
        }
    }

    fn release_stream(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.pending.abort();
        }
    }

    fn adopt_conversation(&mut self, id: ConversationId) {
        if self.session.adopt(id.clone()) {
            self.emit(OrchestratorUpdate::ConversationAdopted(id));
        }
    }

    fn append_delta(&mut self, delta: String) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.received_delta = true;
        let message_id = active.assistant_id;
        if let Some(message) = self.assistant_message_mut(message_id) {
            message.text.push_str(&delta);
            self.emit(OrchestratorUpdate::TextAppended { message_id, delta });
        }
    }

    fn replace_answer_text(&mut self, text: String) {
        let Some(message_id) = self.active.as_ref().map(|a| a.assistant_id) else {
            return;
        };
        if let Some(message) = self.assistant_message_mut(message_id) {
            message.text = text.clone();
            self.emit(OrchestratorUpdate::TextReplaced { message_id, text });
        }
    }

    /// Primary answer finished; attach embedded suggestions or fetch them.
    fn complete_answer(&mut self, embedded: Option<Vec<String>>) {
        self.set_status(ChatStatus::AwaitingSuggestions);

        match embedded {
            Some(raw) => {
                self.attach_suggestions(raw);
                self.finish_turn();
            }
            None if self.options.followup_mode == FollowupMode::Never => self.finish_turn(),
            None => {
                let pending = self.spawn_suggestions();
                if let Some(active) = self.active.as_mut() {
                    active.pending = pending;
                }
            }
        }
    }

    fn attach_suggestions(&mut self, raw: Vec<String>) {
        let Some(message_id) = self.active.as_ref().map(|a| a.assistant_id) else {
            return;
        };
        let normalized = suggestions::normalize(raw);
        if normalized.is_empty() {
            return;
        }
        if let Some(message) = self.assistant_message_mut(message_id) {
            message.suggestions = normalized.clone();
            self.emit(OrchestratorUpdate::SuggestionsAttached {
                message_id,
                suggestions: normalized,
            });
        }
    }

    fn fail_turn(&mut self, err: ChatError) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let turn_id = active.turn.turn_id;
        let message_id = active.assistant_id;
        warn!(%turn_id, "turn failed: {err}");

        let is_empty_placeholder = self
            .state
            .messages
            .iter()
            .any(|m| m.message_id == message_id && m.text.is_empty());
        if is_empty_placeholder {
            self.state.messages.retain(|m| m.message_id != message_id);
            self.emit(OrchestratorUpdate::MessageRemoved(message_id));
        }

        self.state.last_error = Some(err.clone());
        self.emit(OrchestratorUpdate::TurnFailed { turn_id, error: err });
        self.set_status(ChatStatus::Error);
        self.finish_turn();
    }

    fn finish_turn(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(turn_id = %active.turn.turn_id, "turn settled");
        }
        self.state.active_turn_id = None;
        self.set_status(ChatStatus::Idle);
    }

    fn assistant_message_mut(&mut self, message_id: MessageId) -> Option<&mut Message> {
        self.state
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.message_id == message_id)
    }

    fn push_message(&mut self, message: Message) {
        self.state.messages.push(message.clone());
        self.emit(OrchestratorUpdate::MessageAppended(message));
    }

    fn set_status(&mut self, status: ChatStatus) {
        if self.state.status != status {
            self.state.status = status;
            self.emit(OrchestratorUpdate::StatusChanged(status));
        }
    }

    fn emit(&self, update: OrchestratorUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}

fn validate_question(question: &str) -> Result<String, ChatError> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InputInvalid("the question is empty".to_string()));
    }
    if trimmed.chars().count() > MAX_QUESTION_CHARS {
        return Err(ChatError::InputInvalid(format!(
            "the question is longer than {MAX_QUESTION_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}
