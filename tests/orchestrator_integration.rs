use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, broadcast, mpsc};

use tutor_chat::config::FollowupMode;
use tutor_chat::error::FALLBACK_ANSWER;
use tutor_chat::orchestrator::MAX_QUESTION_CHARS;
use tutor_chat::storage::ConversationStore;
use tutor_chat::transport::{
    Classifiers, StreamEvent, StreamHandle, StreamRequest, StreamSession, StreamTransport,
    SuggestionsRequest, UnaryAnswer, UnaryRequest, UnaryTransport,
};
use tutor_chat::{
    ChatError, ChatOrchestrator, ChatStatus, ConversationId, ConversationSession, ErrorKind,
    MemoryStore, MessageRole, OrchestratorUpdate, SendOutcome, TimeoutCause, TurnEvent,
    TurnOptions,
};

struct OpenedStream {
    request: StreamRequest,
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancelled: Arc<AtomicBool>,
}

/// Stream transport whose events are pushed by the test.
#[derive(Default)]
struct ScriptedStream {
    opened: Mutex<Vec<OpenedStream>>,
}

impl ScriptedStream {
    fn count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn sender(&self, index: usize) -> mpsc::UnboundedSender<StreamEvent> {
        self.opened.lock().unwrap()[index].tx.clone()
    }

    fn request(&self, index: usize) -> StreamRequest {
        self.opened.lock().unwrap()[index].request.clone()
    }

    fn was_cancelled(&self, index: usize) -> bool {
        self.opened.lock().unwrap()[index].cancelled.load(Ordering::SeqCst)
    }

    fn push(&self, index: usize, events: Vec<StreamEvent>) {
        let tx = self.sender(index);
        for event in events {
            tx.send(event).unwrap();
        }
    }
}

impl StreamTransport for ScriptedStream {
    fn open(&self, request: StreamRequest) -> StreamSession {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.opened.lock().unwrap().push(OpenedStream {
            request,
            tx,
            cancelled: cancelled.clone(),
        });
        StreamSession {
            events: rx,
            handle: StreamHandle::new(cancelled, None),
        }
    }
}

/// Unary transport with scripted answers and suggestions.
#[derive(Default)]
struct FakeUnary {
    answers: Mutex<VecDeque<Result<UnaryAnswer, ChatError>>>,
    suggestions: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
    ask_calls: AtomicUsize,
    suggestion_calls: AtomicUsize,
    last_ask: Mutex<Option<UnaryRequest>>,
    last_suggestions: Mutex<Option<SuggestionsRequest>>,
}

impl FakeUnary {
    fn with_suggestions(list: &[&str]) -> Self {
        let fake = Self::default();
        *fake.suggestions.lock().unwrap() = list.iter().map(|s| s.to_string()).collect();
        fake
    }

    fn answer(self, answer: Result<UnaryAnswer, ChatError>) -> Self {
        self.answers.lock().unwrap().push_back(answer);
        self
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn ask_calls(&self) -> usize {
        self.ask_calls.load(Ordering::SeqCst)
    }

    fn suggestion_calls(&self) -> usize {
        self.suggestion_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnaryTransport for FakeUnary {
    async fn ask(&self, request: UnaryRequest) -> Result<UnaryAnswer, ChatError> {
        self.ask_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_ask.lock().unwrap() = Some(request);
        let next = self.answers.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ChatError::NetworkUnavailable("no scripted answer".to_string())))
    }

    async fn suggestions(&self, request: SuggestionsRequest) -> Vec<String> {
        self.suggestion_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_suggestions.lock().unwrap() = Some(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let list = self.suggestions.lock().unwrap().clone();
        list
    }
}

struct Harness {
    orchestrator: ChatOrchestrator,
    stream: Arc<ScriptedStream>,
    unary: Arc<FakeUnary>,
    store: Arc<MemoryStore>,
    updates: broadcast::Receiver<OrchestratorUpdate>,
}

impl Harness {
    fn new(unary: FakeUnary, options: TurnOptions) -> Self {
        Self::with_store(unary, options, Arc::new(MemoryStore::new()))
    }

    fn with_store(unary: FakeUnary, options: TurnOptions, store: Arc<MemoryStore>) -> Self {
        let stream = Arc::new(ScriptedStream::default());
        let unary = Arc::new(unary);
        let session = ConversationSession::open(store.clone());
        let orchestrator = ChatOrchestrator::new(
            options,
            session,
            unary.clone(),
            Some(stream.clone() as Arc<dyn StreamTransport>),
        );
        let updates = orchestrator.subscribe();
        Self {
            orchestrator,
            stream,
            unary,
            store,
            updates,
        }
    }

    fn drain_updates(&mut self) -> Vec<OrchestratorUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            updates.push(update);
        }
        updates
    }

    fn assistant_text(&self) -> String {
        self.orchestrator
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.text.clone())
            .unwrap_or_default()
    }

    fn assistant_suggestions(&self) -> Vec<String> {
        self.orchestrator
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.suggestions.clone())
            .unwrap_or_default()
    }
}

fn unary_only() -> TurnOptions {
    TurnOptions {
        streaming: false,
        ..TurnOptions::default()
    }
}

fn answer(text: &str, conversation_id: &str, suggestions: Option<&[&str]>) -> UnaryAnswer {
    UnaryAnswer {
        answer_text: text.to_string(),
        conversation_id: ConversationId::from(conversation_id),
        suggestions: suggestions.map(|list| list.iter().map(|s| s.to_string()).collect()),
    }
}

fn statuses(updates: &[OrchestratorUpdate]) -> Vec<ChatStatus> {
    updates
        .iter()
        .filter_map(|u| match u {
            OrchestratorUpdate::StatusChanged(status) => Some(*status),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_streamed_answer_with_fetched_suggestions() {
    let unary = FakeUnary::with_suggestions(&["What is a base case", "What is a base case?", "  "]);
    let mut h = Harness::new(unary, TurnOptions::default());

    let outcome = h.orchestrator.send("What is recursion?").unwrap();
    assert!(matches!(outcome, SendOutcome::Started(_)));
    assert_eq!(h.orchestrator.status(), ChatStatus::Streaming);
    assert_eq!(h.orchestrator.messages().len(), 2);
    assert_eq!(h.assistant_text(), "");

    h.stream.push(
        0,
        vec![
            StreamEvent::Start(ConversationId::from("abc")),
            StreamEvent::Delta("Recursion ".to_string()),
            StreamEvent::Delta("is...".to_string()),
            StreamEvent::Done,
        ],
    );
    h.orchestrator.settle().await;

    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
    assert_eq!(h.assistant_text(), "Recursion is...");
    assert_eq!(h.assistant_suggestions(), vec!["What is a base case?"]);
    assert_eq!(h.orchestrator.conversation_id().as_str(), "abc");
    assert_eq!(h.store.load().unwrap().as_deref(), Some("abc"));
    assert!(h.orchestrator.last_error().is_none());

    let request = h.unary.last_suggestions.lock().unwrap().clone().unwrap();
    assert_eq!(request.conversation_id.as_str(), "abc");
    assert_eq!(request.desired_count, 3);

    let updates = h.drain_updates();
    assert_eq!(
        statuses(&updates),
        vec![
            ChatStatus::Sending,
            ChatStatus::Streaming,
            ChatStatus::AwaitingSuggestions,
            ChatStatus::Idle,
        ]
    );
    let deltas: Vec<&str> = updates
        .iter()
        .filter_map(|u| match u {
            OrchestratorUpdate::TextAppended { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Recursion ", "is..."]);
    assert!(updates.contains(&OrchestratorUpdate::ConversationAdopted(ConversationId::from("abc"))));
}

#[tokio::test]
async fn test_stream_request_carries_session_and_classifiers() {
    let store = Arc::new(MemoryStore::with_id("stored-id"));
    let options = TurnOptions {
        classifiers: Classifiers {
            major: "Computer Science".to_string(),
            sub_field: "Algorithms".to_string(),
        },
        ..TurnOptions::default()
    };
    let mut h = Harness::with_store(FakeUnary::default(), options, store);

    h.orchestrator.send("  What is recursion?  ").unwrap();
    let request = h.stream.request(0);
    assert_eq!(request.question, "What is recursion?");
    assert_eq!(request.conversation_id.as_str(), "stored-id");
    assert_eq!(request.classifiers.major, "Computer Science");
    assert_eq!(request.classifiers.sub_field, "Algorithms");
}

#[tokio::test]
async fn test_duplicate_send_is_ignored() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());

    assert!(matches!(h.orchestrator.send("first").unwrap(), SendOutcome::Started(_)));
    assert_eq!(h.orchestrator.send("second").unwrap(), SendOutcome::Ignored);
    assert_eq!(h.orchestrator.retry().unwrap(), SendOutcome::Ignored);

    assert_eq!(h.stream.count(), 1);
    assert_eq!(h.orchestrator.messages().len(), 2);
    assert_eq!(h.orchestrator.messages()[0].text, "first");
}

#[tokio::test]
async fn test_stall_removes_placeholder_and_reports_timeout() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());
    h.orchestrator.send("What is recursion?").unwrap();

    h.stream.push(0, vec![StreamEvent::Error(ChatError::Timeout(TimeoutCause::Stall))]);
    h.orchestrator.settle().await;

    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
    assert_eq!(h.orchestrator.last_error().unwrap().kind(), ErrorKind::Timeout);
    assert_eq!(h.orchestrator.messages().len(), 1);
    assert_eq!(h.orchestrator.messages()[0].role, MessageRole::User);
    assert_eq!(h.unary.ask_calls(), 0);
    assert_eq!(h.unary.suggestion_calls(), 0);

    let updates = h.drain_updates();
    assert_eq!(
        statuses(&updates),
        vec![
            ChatStatus::Sending,
            ChatStatus::Streaming,
            ChatStatus::Error,
            ChatStatus::Idle,
        ]
    );
    assert!(updates.iter().any(|u| matches!(u, OrchestratorUpdate::MessageRemoved(_))));
    assert!(updates.iter().any(|u| matches!(
        u,
        OrchestratorUpdate::TurnFailed {
            error: ChatError::Timeout(TimeoutCause::Stall),
            ..
        }
    )));
}

#[tokio::test]
async fn test_error_after_partial_text_keeps_message() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());
    h.orchestrator.send("What is recursion?").unwrap();

    h.stream.push(
        0,
        vec![
            StreamEvent::Delta("Recursion is".to_string()),
            StreamEvent::Error(ChatError::NetworkUnavailable("reset by peer".to_string())),
        ],
    );
    h.orchestrator.settle().await;

    assert_eq!(h.orchestrator.messages().len(), 2);
    assert_eq!(h.assistant_text(), "Recursion is");
    assert_eq!(
        h.orchestrator.last_error().unwrap().kind(),
        ErrorKind::NetworkUnavailable
    );
}

#[tokio::test]
async fn test_stale_turn_events_are_ignored() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());

    let SendOutcome::Started(first) = h.orchestrator.send("first").unwrap() else {
        panic!("first send should start");
    };
    assert!(h.orchestrator.cancel());
    h.orchestrator.send("second").unwrap();
    let before = h.orchestrator.messages().to_vec();
    h.drain_updates();

    h.orchestrator
        .handle_event(first, TurnEvent::Stream(StreamEvent::Delta("stale".to_string())));
    h.orchestrator.handle_event(first, TurnEvent::Stream(StreamEvent::Done));
    h.orchestrator.handle_event(
        first,
        TurnEvent::Stream(StreamEvent::Error(ChatError::Timeout(TimeoutCause::Stall))),
    );
    h.orchestrator
        .handle_event(first, TurnEvent::Suggestions(vec!["Late?".to_string()]));

    assert_eq!(h.orchestrator.messages(), before.as_slice());
    assert_eq!(h.orchestrator.status(), ChatStatus::Streaming);
    assert!(h.orchestrator.last_error().is_none());
    assert!(h.drain_updates().is_empty());
}

#[tokio::test]
async fn test_cancel_keeps_partial_text() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());
    h.orchestrator.send("What is recursion?").unwrap();

    h.stream.push(0, vec![StreamEvent::Delta("Partial".to_string())]);
    assert!(h.orchestrator.next_event().await);
    assert_eq!(h.assistant_text(), "Partial");

    assert!(h.orchestrator.cancel());
    assert!(h.stream.was_cancelled(0));
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
    assert_eq!(h.orchestrator.messages().len(), 2);
    assert_eq!(h.assistant_text(), "Partial");
    assert!(h.orchestrator.last_error().is_none());

    assert!(!h.orchestrator.next_event().await);
    assert!(!h.orchestrator.cancel());
    assert!(
        h.drain_updates()
            .iter()
            .any(|u| matches!(
                u,
                OrchestratorUpdate::TurnCancelled {
                    error: ChatError::Cancelled,
                    ..
                }
            ))
    );
}

#[tokio::test]
async fn test_empty_suggestions_settle_to_idle_without_error() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());
    h.orchestrator.send("What is recursion?").unwrap();

    h.stream.push(
        0,
        vec![StreamEvent::Delta("Recursion is...".to_string()), StreamEvent::Done],
    );
    h.orchestrator.settle().await;

    assert_eq!(h.unary.suggestion_calls(), 1);
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
    assert!(h.assistant_suggestions().is_empty());
    assert!(h.orchestrator.last_error().is_none());
    assert!(!statuses(&h.drain_updates()).contains(&ChatStatus::Error));
}

#[tokio::test]
async fn test_suggestion_for_superseded_turn_is_dropped() {
    let gate = Arc::new(Notify::new());
    let unary = FakeUnary::with_suggestions(&["Too late"]).gated(gate.clone());
    let mut h = Harness::new(unary, TurnOptions::default());

    let SendOutcome::Started(first) = h.orchestrator.send("first").unwrap() else {
        panic!("first send should start");
    };
    h.stream.push(0, vec![StreamEvent::Delta("One".to_string()), StreamEvent::Done]);
    assert!(h.orchestrator.next_event().await);
    assert!(h.orchestrator.next_event().await);
    assert_eq!(h.orchestrator.status(), ChatStatus::AwaitingSuggestions);

    // Awaiting suggestions does not block a new question.
    assert!(matches!(h.orchestrator.send("second").unwrap(), SendOutcome::Started(_)));
    gate.notify_waiters();
    h.orchestrator
        .handle_event(first, TurnEvent::Suggestions(vec!["Too late".to_string()]));

    let first_answer = &h.orchestrator.messages()[1];
    assert_eq!(first_answer.text, "One");
    assert!(first_answer.suggestions.is_empty());
    assert_eq!(h.orchestrator.messages().len(), 4);
    assert_eq!(h.orchestrator.status(), ChatStatus::Streaming);
}

#[tokio::test]
async fn test_unary_embedded_suggestions_skip_fetch() {
    let unary = FakeUnary::default().answer(Ok(answer(
        "Recursion is...",
        "srv-1",
        Some(&["What is a base case", "what is a base case?", "Show an example."]),
    )));
    let mut h = Harness::new(unary, unary_only());

    h.orchestrator.send("What is recursion?").unwrap();
    h.orchestrator.settle().await;

    assert_eq!(h.stream.count(), 0);
    assert_eq!(h.unary.ask_calls(), 1);
    assert_eq!(h.unary.suggestion_calls(), 0);
    assert_eq!(h.assistant_text(), "Recursion is...");
    assert_eq!(
        h.assistant_suggestions(),
        vec!["What is a base case?", "Show an example."]
    );
    assert_eq!(h.orchestrator.conversation_id().as_str(), "srv-1");
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);

    let request = h.unary.last_ask.lock().unwrap().clone().unwrap();
    assert_eq!(request.followup_mode, FollowupMode::Multi);
    assert_eq!(request.suggest_count, 3);
    assert!(request.conversation_id.is_some());
}

#[tokio::test]
async fn test_unary_without_suggestions_fetches_them() {
    let unary = FakeUnary::with_suggestions(&["Next"])
        .answer(Ok(answer("Recursion is...", "srv-1", None)));
    let mut h = Harness::new(unary, unary_only());

    h.orchestrator.send("What is recursion?").unwrap();
    h.orchestrator.settle().await;

    assert_eq!(h.unary.suggestion_calls(), 1);
    assert_eq!(h.assistant_suggestions(), vec!["Next?"]);
}

#[tokio::test]
async fn test_followup_never_skips_fetch() {
    let unary = FakeUnary::with_suggestions(&["Next"])
        .answer(Ok(answer("Recursion is...", "srv-1", None)));
    let options = TurnOptions {
        followup_mode: FollowupMode::Never,
        ..unary_only()
    };
    let mut h = Harness::new(unary, options);

    h.orchestrator.send("What is recursion?").unwrap();
    h.orchestrator.settle().await;

    assert_eq!(h.unary.suggestion_calls(), 0);
    assert!(h.assistant_suggestions().is_empty());
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
}

#[tokio::test]
async fn test_malformed_answer_shows_fallback() {
    let unary = FakeUnary::default()
        .answer(Err(ChatError::MalformedResponse("missing aiResponse".to_string())));
    let mut h = Harness::new(unary, unary_only());

    h.orchestrator.send("What is recursion?").unwrap();
    h.orchestrator.settle().await;

    assert_eq!(h.orchestrator.messages().len(), 2);
    assert_eq!(h.assistant_text(), FALLBACK_ANSWER);
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
    assert_eq!(
        h.orchestrator.last_error().unwrap().kind(),
        ErrorKind::MalformedResponse
    );
    assert_eq!(h.unary.suggestion_calls(), 0);
    assert!(!statuses(&h.drain_updates()).contains(&ChatStatus::Error));
}

#[tokio::test]
async fn test_server_error_keeps_status_code() {
    let unary = FakeUnary::default().answer(Err(ChatError::ServerError {
        status: Some(503),
        message: "unavailable".to_string(),
    }));
    let mut h = Harness::new(unary, unary_only());

    h.orchestrator.send("What is recursion?").unwrap();
    h.orchestrator.settle().await;

    assert_eq!(h.orchestrator.messages().len(), 1);
    assert!(matches!(
        h.orchestrator.last_error(),
        Some(ChatError::ServerError { status: Some(503), .. })
    ));
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
}

#[tokio::test]
async fn test_fallback_on_stall_uses_unary() {
    let unary = FakeUnary::with_suggestions(&["Why"])
        .answer(Ok(answer("Recursion is...", "srv-2", None)));
    let options = TurnOptions {
        fallback_on_stall: true,
        ..TurnOptions::default()
    };
    let mut h = Harness::new(unary, options);

    h.orchestrator.send("What is recursion?").unwrap();
    h.stream.push(0, vec![StreamEvent::Error(ChatError::Timeout(TimeoutCause::Stall))]);
    h.orchestrator.settle().await;

    assert!(h.stream.was_cancelled(0));
    assert_eq!(h.unary.ask_calls(), 1);
    assert_eq!(h.assistant_text(), "Recursion is...");
    assert_eq!(h.assistant_suggestions(), vec!["Why?"]);
    assert!(h.orchestrator.last_error().is_none());
    assert_eq!(h.orchestrator.conversation_id().as_str(), "srv-2");
}

#[tokio::test]
async fn test_retry_resends_last_question() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());
    assert_eq!(
        h.orchestrator.retry().unwrap_err().kind(),
        ErrorKind::InputInvalid
    );

    h.orchestrator.send("What is recursion?").unwrap();
    h.stream.push(
        0,
        vec![StreamEvent::Error(ChatError::ServerError {
            status: Some(500),
            message: "boom".to_string(),
        })],
    );
    h.orchestrator.settle().await;
    assert_eq!(h.orchestrator.messages().len(), 1);

    assert!(matches!(h.orchestrator.retry().unwrap(), SendOutcome::Started(_)));
    assert_eq!(h.stream.count(), 2);
    assert_eq!(h.stream.request(1).question, "What is recursion?");
    assert!(h.orchestrator.last_error().is_none());

    let users: Vec<&str> = h
        .orchestrator
        .messages()
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.text.as_str())
        .collect();
    assert_eq!(users, vec!["What is recursion?", "What is recursion?"]);
}

#[tokio::test]
async fn test_reset_clears_history_and_rotates_conversation() {
    let store = Arc::new(MemoryStore::with_id("old-id"));
    let mut h = Harness::with_store(FakeUnary::default(), TurnOptions::default(), store);

    h.orchestrator.send("What is recursion?").unwrap();
    h.stream.push(0, vec![StreamEvent::Delta("Partial".to_string())]);
    assert!(h.orchestrator.next_event().await);

    h.orchestrator.reset();

    assert!(h.stream.was_cancelled(0));
    assert!(h.orchestrator.messages().is_empty());
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
    assert!(h.orchestrator.state().active_turn_id.is_none());
    let fresh = h.orchestrator.conversation_id();
    assert_ne!(fresh.as_str(), "old-id");
    assert_eq!(h.store.load().unwrap().as_deref(), Some(fresh.as_str()));

    let updates = h.drain_updates();
    assert!(updates.contains(&OrchestratorUpdate::HistoryCleared));
    assert!(updates.contains(&OrchestratorUpdate::ConversationRotated(fresh)));
}

#[tokio::test]
async fn test_invalid_input_changes_nothing() {
    let mut h = Harness::new(FakeUnary::default(), TurnOptions::default());

    let err = h.orchestrator.send("   ").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputInvalid);
    let err = h
        .orchestrator
        .send(&"x".repeat(MAX_QUESTION_CHARS + 1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputInvalid);

    assert!(h.orchestrator.messages().is_empty());
    assert_eq!(h.orchestrator.status(), ChatStatus::Idle);
    assert_eq!(h.stream.count(), 0);
    assert!(h.drain_updates().is_empty());
}

#[tokio::test]
async fn test_conversation_id_survives_reload() {
    let store = Arc::new(MemoryStore::new());
    let mut h = Harness::with_store(FakeUnary::default(), TurnOptions::default(), store.clone());

    h.orchestrator.send("What is recursion?").unwrap();
    h.stream.push(
        0,
        vec![StreamEvent::Start(ConversationId::from("abc")), StreamEvent::Delta("R".to_string())],
    );
    assert!(h.orchestrator.next_event().await);
    h.orchestrator.shutdown();
    assert!(h.stream.was_cancelled(0));

    let mut reloaded = ConversationSession::open(store);
    assert_eq!(reloaded.get().as_str(), "abc");
}
