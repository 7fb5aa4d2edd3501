use crate::error::{RagchatError, Result};
use crate::llm::{classify_provider_error, is_retryable, ChatMessage, ChatModel, CompletionRequest};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_RETRIES: usize = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed line of a streaming completion body.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Token(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        // Comments (": keep-alive"), event names and blank separators
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| RagchatError::Llm(format!("Malformed stream chunk: {}", e)))?;
    let token = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();

    if token.is_empty() {
        Ok(StreamLine::Skip)
    } else {
        Ok(StreamLine::Token(token))
    }
}

/// OpenAI-compatible chat completions client
pub struct OpenAIChat {
    client: Client,
    api_base: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAIChat {
    /// `timeout` bounds a whole completion, but only the idle time between
    /// chunks of a streamed one, so long answers are not cut off mid-stream.
    pub fn new(api_base: impl Into<String>, api_key: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(timeout)
            .build()
            .map_err(|e| RagchatError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    /// Send the request, retrying rate-limit and 5xx responses with exponential backoff.
    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let body = ChatCompletionBody {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            stream,
        };
        let url = format!("{}/chat/completions", self.api_base);
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;

        loop {
            let mut builder = self.client.post(&url).bearer_auth(&self.api_key).json(&body);
            if !stream {
                builder = builder.timeout(self.timeout);
            }
            let response = builder
                .send()
                .await
                .map_err(|e| RagchatError::Llm(format!("Network error: {}", e)))?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            let err = classify_provider_error(status, &text, "chat");

            if attempt < MAX_RETRIES && is_retryable(status) && !matches!(err, RagchatError::QuotaExceeded(_)) {
                log::warn!("Chat completion retry {}/{} after {}", attempt + 1, MAX_RETRIES, status);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self.send(request, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| RagchatError::Llm(format!("Failed to parse response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RagchatError::Llm("Empty completion response".to_string()))
    }

    async fn stream(&self, request: &CompletionRequest, tokens: mpsc::Sender<String>) -> Result<String> {
        let start = std::time::Instant::now();
        let response = self.send(request, true).await?;
        let mut body = response.bytes_stream();
        // Bytes, not text: a chunk boundary may split a multi-byte character
        let mut buffer: Vec<u8> = Vec::new();
        let mut full = String::new();

        'outer: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RagchatError::Llm(format!("Stream interrupted: {}", e)))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                match parse_stream_line(&String::from_utf8_lossy(&line))? {
                    StreamLine::Token(token) => {
                        full.push_str(&token);
                        if tokens.send(token).await.is_err() {
                            log::debug!("Token receiver dropped, abandoning {} stream", request.model);
                            break 'outer;
                        }
                    }
                    StreamLine::Done => break 'outer,
                    StreamLine::Skip => {}
                }
            }
        }

        log::debug!(
            "Streamed {} chars from {} in {:?}",
            full.len(),
            request.model,
            start.elapsed()
        );
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_line() {
        let line = r#"data: {"id":"x","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_stream_line(line).unwrap(), StreamLine::Token("Hel".to_string()));
    }

    #[test]
    fn test_parse_role_only_delta_is_skipped() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_stream_line(line).unwrap(), StreamLine::Skip);
    }

    #[test]
    fn test_parse_done_and_comments() {
        assert_eq!(parse_stream_line("data: [DONE]\n").unwrap(), StreamLine::Done);
        assert_eq!(parse_stream_line(": keep-alive").unwrap(), StreamLine::Skip);
        assert_eq!(parse_stream_line("").unwrap(), StreamLine::Skip);
    }

    #[test]
    fn test_parse_malformed_chunk() {
        assert!(matches!(parse_stream_line("data: {oops"), Err(RagchatError::Llm(_))));
    }

    /// Local completions endpoint: streamed answers trickle out one chunk every
    /// 300ms, plain completions take two seconds.
    async fn slow_server() -> String {
        use axum::body::Body;
        use axum::routing::post;
        use axum::Json;
        use serde_json::Value;

        async fn completions(Json(body): Json<Value>) -> axum::response::Response {
            if body["stream"] == true {
                let chunks = futures_util::stream::unfold(0u8, |i| async move {
                    if i > 4 {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let line = if i == 4 {
                        "data: [DONE]\n\n".to_string()
                    } else {
                        format!("data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"t{}\"}}}}]}}\n\n", i)
                    };
                    Some((Ok::<_, std::convert::Infallible>(line), i + 1))
                });
                axum::response::Response::new(Body::from_stream(chunks))
            } else {
                tokio::time::sleep(Duration::from_secs(2)).await;
                axum::response::IntoResponse::into_response(Json(serde_json::json!({
                    "choices": [{"message": {"content": "late"}}]
                })))
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/chat/completions", post(completions));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.2,
        }
    }

    #[tokio::test]
    async fn test_long_stream_outlives_timeout() {
        let chat = OpenAIChat::new(slow_server().await, "k".into(), Duration::from_millis(800)).unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let answer = chat.stream(&request(), tx).await.unwrap();
        assert_eq!(answer, "t0t1t2t3");
        assert_eq!(rx.recv().await.as_deref(), Some("t0"));
    }

    #[tokio::test]
    async fn test_completion_still_times_out() {
        let chat = OpenAIChat::new(slow_server().await, "k".into(), Duration::from_millis(500)).unwrap();
        assert!(matches!(chat.complete(&request()).await, Err(RagchatError::Llm(_))));
    }

    #[test]
    fn test_api_base_trailing_slash_trimmed() {
        let chat = OpenAIChat::new("https://api.example.com/v1/", "k".into(), Duration::from_secs(5)).unwrap();
        assert_eq!(chat.api_base, "https://api.example.com/v1");
    }
}
