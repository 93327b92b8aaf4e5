//! Single-shot requests: `POST /chat`, `POST /suggestions`, `GET /health`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{SuggestionsRequest, UnaryAnswer, UnaryRequest, UnaryTransport, endpoint};
use crate::config::FollowupMode;
use crate::error::ChatError;
use crate::events::ConversationId;
use crate::suggestions::string_entries;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequestBody<'a> {
    user_question: &'a str,
    major: &'a str,
    sub_field: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    followup_mode: FollowupMode,
    suggest_count: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponseBody {
    ai_response: String,
    conversation_id: String,
    #[serde(default)]
    suggestions: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SuggestionsRequestBody<'a> {
    conversation_id: &'a str,
    major: &'a str,
    sub_field: &'a str,
    suggest_count: u8,
}

#[derive(Debug, Deserialize)]
struct SuggestionsResponseBody {
    #[serde(default)]
    suggestions: Vec<serde_json::Value>,
}

/// Unary transport backed by reqwest.
#[derive(Clone)]
pub struct HttpUnaryTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpUnaryTransport {
    /// `timeout` bounds each request end to end.
    pub fn new(base_url: Url, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Connectivity probe; returns the trimmed response body.
    pub async fn health(&self) -> Result<String, ChatError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, "health"))
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| ChatError::from_reqwest(&e))?;
        if !status.is_success() {
            return Err(ChatError::from_status(status.as_u16(), &body));
        }
        Ok(body.trim().to_string())
    }

    async fn fetch_suggestions(&self, request: &SuggestionsRequest) -> Result<Vec<String>, ChatError> {
        let body = SuggestionsRequestBody {
            conversation_id: request.conversation_id.as_str(),
            major: &request.classifiers.major,
            sub_field: &request.classifiers.sub_field,
            suggest_count: request.desired_count,
        };
        let response = self
            .client
            .post(endpoint(&self.base_url, "suggestions"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status.as_u16(), &text));
        }
        let bytes = response.bytes().await.map_err(|e| ChatError::from_reqwest(&e))?;
        let parsed: SuggestionsResponseBody = serde_json::from_slice(&bytes)
            .map_err(|e| ChatError::MalformedResponse(e.to_string()))?;
        Ok(string_entries(&parsed.suggestions))
    }
}

#[async_trait]
impl UnaryTransport for HttpUnaryTransport {
    async fn ask(&self, request: UnaryRequest) -> Result<UnaryAnswer, ChatError> {
        let body = ChatRequestBody {
            user_question: &request.question,
            major: &request.classifiers.major,
            sub_field: &request.classifiers.sub_field,
            conversation_id: request.conversation_id.as_ref().map(ConversationId::as_str),
            followup_mode: request.followup_mode,
            suggest_count: request.suggest_count,
        };
        debug!("POST /chat ({} chars)", request.question.chars().count());

        let response = self
            .client
            .post(endpoint(&self.base_url, "chat"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status.as_u16(), &text));
        }

        let bytes = response.bytes().await.map_err(|e| ChatError::from_reqwest(&e))?;
        let parsed: ChatResponseBody = serde_json::from_slice(&bytes)
            .map_err(|e| ChatError::MalformedResponse(e.to_string()))?;
        if parsed.ai_response.trim().is_empty() {
            return Err(ChatError::MalformedResponse("empty aiResponse".to_string()));
        }

        Ok(UnaryAnswer {
            answer_text: parsed.ai_response,
            conversation_id: ConversationId::from(parsed.conversation_id),
            suggestions: parsed.suggestions.as_deref().map(string_entries),
        })
    }

    async fn suggestions(&self, request: SuggestionsRequest) -> Vec<String> {
        match self.fetch_suggestions(&request).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Suggestions unavailable: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_body_shape() {
        let body = ChatRequestBody {
            user_question: "What is recursion?",
            major: "CS",
            sub_field: "Algorithms",
            conversation_id: None,
            followup_mode: FollowupMode::Multi,
            suggest_count: 3,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "userQuestion": "What is recursion?",
                "major": "CS",
                "subField": "Algorithms",
                "followupMode": "multi",
                "suggestCount": 3
            })
        );
    }

    #[test]
    fn test_response_requires_answer_and_id() {
        assert!(serde_json::from_str::<ChatResponseBody>(r#"{"aiResponse":"hi"}"#).is_err());
        let ok: ChatResponseBody =
            serde_json::from_str(r#"{"aiResponse":"hi","conversationId":"c1"}"#).unwrap();
        assert!(ok.suggestions.is_none());
    }
}
