//! Streamed answers over `GET /chat/stream`.

use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::sse::SseDecoder;
use super::{
    StreamEvent, StreamHandle, StreamPolicy, StreamRequest, StreamSession, StreamTransport, endpoint,
};
use crate::error::{ChatError, TimeoutCause};
use crate::events::ConversationId;

/// Pushed events, discriminated by their JSON `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Start { conversation_id: String },
    AnswerDelta { text: String },
    Done,
    Error { message: String },
    /// Any `type` this client does not know about
    Unknown(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    conversation_id: String,
}

#[derive(Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
}

impl ServerEvent {
    pub fn parse(data: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(data).map_err(|e| e.to_string())?;
        let typ = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or("missing type")?;
        match typ {
            "start" => {
                let p: StartPayload = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(ServerEvent::Start {
                    conversation_id: p.conversation_id,
                })
            }
            "answer_delta" => {
                let p: DeltaPayload = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(ServerEvent::AnswerDelta { text: p.text })
            }
            "done" => Ok(ServerEvent::Done),
            "error" => {
                let p: ErrorPayload = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(ServerEvent::Error { message: p.message })
            }
            other => Ok(ServerEvent::Unknown(other.to_string())),
        }
    }
}

/// Stream transport backed by reqwest.
#[derive(Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    base_url: Url,
    policy: StreamPolicy,
}

impl HttpStreamTransport {
    pub fn new(base_url: Url, policy: StreamPolicy) -> reqwest::Result<Self> {
        // No overall timeout here: the stream is bounded by the policy ceiling.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url,
            policy,
        })
    }

    fn stream_url(&self, request: &StreamRequest) -> Url {
        let mut url = endpoint(&self.base_url, "chat/stream");
        url.query_pairs_mut()
            .append_pair("q", &request.question)
            .append_pair("major", &request.classifiers.major)
            .append_pair("subField", &request.classifiers.sub_field)
            .append_pair("conversationId", request.conversation_id.as_str());
        url
    }
}

impl StreamTransport for HttpStreamTransport {
    fn open(&self, request: StreamRequest) -> StreamSession {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let sink = EventSink {
            tx,
            cancelled: cancelled.clone(),
        };
        let url = self.stream_url(&request);
        let task = tokio::spawn(run_stream(self.client.clone(), url, self.policy, sink));

        StreamSession {
            events: rx,
            handle: StreamHandle::new(cancelled, Some(task)),
        }
    }
}

/// Sending side of a stream; refuses delivery once cancelled.
struct EventSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancelled: Arc<AtomicBool>,
}

impl EventSink {
    fn emit(&self, event: StreamEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

/// Why one connection attempt ended without a terminal event.
enum AttemptError {
    /// Worth reconnecting
    Connection(String),
    /// Ends the stream
    Fatal(ChatError),
    /// Nobody is listening any more
    Closed,
}

#[derive(Default)]
struct Progress {
    started: bool,
    delivered: bool,
}

async fn run_stream(client: reqwest::Client, url: Url, policy: StreamPolicy, sink: EventSink) {
    let outcome = tokio::time::timeout(policy.max_duration, drive(&client, &url, &policy, &sink)).await;

    let terminal = match outcome {
        Ok(Ok(())) => StreamEvent::Done,
        Ok(Err(AttemptError::Closed)) => return,
        Ok(Err(AttemptError::Fatal(e))) => StreamEvent::Error(e),
        Ok(Err(AttemptError::Connection(msg))) => StreamEvent::Error(ChatError::NetworkUnavailable(msg)),
        Err(_) => {
            warn!("Stream exceeded {:?}, closing", policy.max_duration);
            StreamEvent::Error(ChatError::Timeout(TimeoutCause::Ceiling))
        }
    };
    sink.emit(terminal);
}

/// Connect, read, and reconnect until a terminal outcome.
async fn drive(
    client: &reqwest::Client,
    url: &Url,
    policy: &StreamPolicy,
    sink: &EventSink,
) -> Result<(), AttemptError> {
    let mut progress = Progress::default();
    let mut attempt = 0;

    loop {
        match read_once(client, url, policy, sink, &mut progress).await {
            Err(AttemptError::Connection(msg)) if !progress.delivered => {
                attempt += 1;
                let Some(delay) = policy.reconnect.delay_for(attempt) else {
                    warn!("Stream connection failed after {} retries: {}", attempt - 1, msg);
                    return Err(AttemptError::Connection(msg));
                };
                warn!("Stream connection failed ({msg}), reconnecting in {delay:?}");
                tokio::time::sleep(delay).await;
                if sink.is_closed() {
                    return Err(AttemptError::Closed);
                }
            }
            other => return other,
        }
    }
}

/// One connection attempt.
async fn read_once(
    client: &reqwest::Client,
    url: &Url,
    policy: &StreamPolicy,
    sink: &EventSink,
    progress: &mut Progress,
) -> Result<(), AttemptError> {
    debug!("Opening stream {}", url.path());
    // Waiting for headers counts against the stall budget too.
    let stall_deadline = Instant::now() + policy.stall_timeout;
    let request = client
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .send();
    let response = match tokio::time::timeout_at(stall_deadline, request).await {
        Ok(result) => result.map_err(|e| AttemptError::Connection(e.to_string()))?,
        Err(_) => {
            warn!("No response headers within {:?}", policy.stall_timeout);
            return Err(AttemptError::Fatal(ChatError::Timeout(TimeoutCause::Stall)));
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AttemptError::Fatal(ChatError::from_status(status.as_u16(), &body)));
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let next = if progress.delivered {
            body.next().await
        } else {
            match tokio::time::timeout_at(stall_deadline, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("No answer text within {:?}", policy.stall_timeout);
                    return Err(AttemptError::Fatal(ChatError::Timeout(TimeoutCause::Stall)));
                }
            }
        };

        let ended = next.is_none();
        let payloads = match next {
            Some(Ok(chunk)) => decoder.push(&chunk),
            Some(Err(e)) => return Err(AttemptError::Connection(e.to_string())),
            None => match decoder.finish() {
                Some(last) => vec![last],
                None => Vec::new(),
            },
        };

        for data in payloads {
            match ServerEvent::parse(&data) {
                Ok(ServerEvent::Start { conversation_id }) => {
                    if !progress.started {
                        progress.started = true;
                        if !sink.emit(StreamEvent::Start(ConversationId::from(conversation_id))) {
                            return Err(AttemptError::Closed);
                        }
                    }
                }
                Ok(ServerEvent::AnswerDelta { text }) => {
                    progress.delivered = true;
                    if !sink.emit(StreamEvent::Delta(text)) {
                        return Err(AttemptError::Closed);
                    }
                }
                Ok(ServerEvent::Done) => return Ok(()),
                Ok(ServerEvent::Error { message }) => {
                    return Err(AttemptError::Fatal(ChatError::from_remote_message(&message)));
                }
                Ok(ServerEvent::Unknown(typ)) => debug!("Ignoring stream event type {typ}"),
                Err(e) => warn!("Ignoring malformed stream event: {e}"),
            }
        }

        if ended {
            info!("Stream closed before completion");
            return Err(AttemptError::Connection("stream closed before completion".to_string()));
        }
    }
}
