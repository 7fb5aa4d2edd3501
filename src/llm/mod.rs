//! Chat completion models.
//!
//! The chat pipeline only talks to [`ChatModel`]; [`OpenAIChat`] is the
//! production implementation against any OpenAI-compatible endpoint.

pub mod openai;

use crate::error::{RagchatError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use openai::OpenAIChat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

/// One model invocation.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run a completion and return the whole text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Run a streaming completion, sending every token through `tokens` as it
    /// arrives. Returns the full text. If the receiving side goes away the
    /// stream is abandoned and the text produced so far is returned.
    async fn stream(&self, request: &CompletionRequest, tokens: mpsc::Sender<String>) -> Result<String>;
}

/// Map a failed OpenAI-style response to our error taxonomy.
///
/// Body shape: `{"error": {"message": "...", "type": "...", "code": "..."}}`.
pub(crate) fn classify_provider_error(status: StatusCode, body: &str, service: &str) -> RagchatError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let field = |name: &str| {
        error
            .and_then(|e| e.get(name))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let code = field("code");
    let kind = field("type");
    let message = match field("message") {
        m if m.is_empty() => body.chars().take(500).collect(),
        m => m,
    };

    if code == "insufficient_quota" || kind == "insufficient_quota" {
        return RagchatError::QuotaExceeded(format!("{}: {}", service, message));
    }

    let detail = format!("{} API error {}: {}", service, status, message);
    if service == "embeddings" {
        RagchatError::Embedding(detail)
    } else {
        RagchatError::Llm(detail)
    }
}

/// Whether a provider failure is worth retrying (rate limiting or server trouble).
pub(crate) fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_classified() {
        let body = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        let err = classify_provider_error(StatusCode::TOO_MANY_REQUESTS, body, "chat");
        assert!(matches!(err, RagchatError::QuotaExceeded(_)));
    }

    #[test]
    fn test_generic_error_keeps_message() {
        let body = r#"{"error":{"message":"model overloaded","type":"server_error"}}"#;
        let err = classify_provider_error(StatusCode::SERVICE_UNAVAILABLE, body, "chat");
        match err {
            RagchatError::Llm(msg) => assert!(msg.contains("model overloaded")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_json_body_for_embeddings() {
        let err = classify_provider_error(StatusCode::BAD_GATEWAY, "upstream down", "embeddings");
        assert!(matches!(err, RagchatError::Embedding(ref m) if m.contains("upstream down")));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }
}
