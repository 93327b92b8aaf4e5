//! Classified errors surfaced by transports and the orchestrator.

use thiserror::Error;

/// Text shown in place of an answer whose body could not be understood.
pub const FALLBACK_ANSWER: &str =
    "Sorry, I couldn't put together an answer this time. Please try asking again.";

/// Status codes that mean the remote generation step, not the network, was slow.
const TIMEOUT_STATUSES: [u16; 3] = [408, 504, 524];

/// Why a turn timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TimeoutCause {
    /// No delta arrived within the grace period after the stream opened.
    #[strum(to_string = "no answer text arrived in time")]
    Stall,
    /// The stream hit its absolute wall-clock ceiling.
    #[strum(to_string = "the answer stream ran too long")]
    Ceiling,
    /// The single-shot request exceeded its deadline.
    #[strum(to_string = "the request took too long")]
    Request,
    /// The server reported that answer generation timed out.
    #[strum(to_string = "the server took too long to generate an answer")]
    Gateway,
}

/// Error category, without payload. This is what the UI branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InputInvalid,
    NetworkUnavailable,
    Timeout,
    ServerError,
    MalformedResponse,
    Cancelled,
}

/// Errors that can end a turn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Question rejected before any network call.
    #[error("invalid question: {0}")]
    InputInvalid(String),

    /// Connection failed, including exhausted reconnect attempts.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Stall, ceiling, request or gateway timeout.
    #[error("timed out: {0}")]
    Timeout(TimeoutCause),

    /// Non-2xx response, or an `error` event pushed by the server.
    #[error("server error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ServerError { status: Option<u16>, message: String },

    /// A 2xx response whose body failed shape validation.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Turn cancelled by the user.
    #[error("cancelled")]
    Cancelled,
}

impl ChatError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InputInvalid(_) => ErrorKind::InputInvalid,
            Self::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Map a non-2xx HTTP status (and its body, if any) to an error.
    pub fn from_status(status: u16, body: &str) -> Self {
        if TIMEOUT_STATUSES.contains(&status) || mentions_timeout(body) {
            return Self::Timeout(TimeoutCause::Gateway);
        }
        let message = body.trim();
        Self::ServerError {
            status: Some(status),
            message: if message.is_empty() {
                format!("HTTP {status}")
            } else {
                message.chars().take(200).collect()
            },
        }
    }

    /// Map the payload of a pushed `error` event.
    pub fn from_remote_message(message: &str) -> Self {
        if mentions_timeout(message) {
            return Self::Timeout(TimeoutCause::Gateway);
        }
        let message = message.trim();
        Self::ServerError {
            status: None,
            message: if message.is_empty() {
                "streaming error".to_string()
            } else {
                message.to_string()
            },
        }
    }

    /// Map a request-level failure from the HTTP client.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(TimeoutCause::Request)
        } else if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), "")
        } else {
            Self::NetworkUnavailable(err.to_string())
        }
    }

    /// Whether a user retry is likely to help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable(_) | Self::Timeout(_) | Self::ServerError { .. }
        )
    }

    /// Message for the dismissible error indicator.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InputInvalid(reason) => format!("Please check your question: {reason}."),
            Self::NetworkUnavailable(_) => {
                "The connection isn't going through. Check your network and try again.".to_string()
            }
            Self::Timeout(TimeoutCause::Gateway) => {
                "The tutor is taking longer than usual to answer. Please retry in a moment."
                    .to_string()
            }
            Self::Timeout(cause) => format!("The answer timed out ({cause}). Please retry."),
            Self::ServerError { status: Some(status), .. } => {
                format!("The server ran into a problem (HTTP {status}). Please retry.")
            }
            Self::ServerError { message, .. } => {
                format!("The server ran into a problem: {message}")
            }
            Self::MalformedResponse(_) => FALLBACK_ANSWER.to_string(),
            Self::Cancelled => String::new(),
        }
    }
}

fn mentions_timeout(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("timeout") || lower.contains("timed out")
}
