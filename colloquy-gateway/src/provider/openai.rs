//! OpenAI-compatible provider.
//!
//! Works against any server exposing `/v1/chat/completions`. Streaming uses
//! server-sent events: `data: {json}` lines ending with `data: [DONE]`.

use super::{fragment_stream, ChatMessage, ChatRequest, ChatResponse, FragmentStream, LineEvent, Provider, ProviderError};
use async_trait::async_trait;
use colloquy_store::TokenUsage;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const NAME: &str = "openai";

/// OpenAI API provider.
pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAIProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    /// Create a new OpenAI provider.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self::with_base_url(api_key, Self::DEFAULT_BASE_URL, timeout)
    }

    /// Create with custom base URL (for compatible servers).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Self {
        let api_key = api_key.into();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !api_key.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", api_key)) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = OpenAIRequest {
            model: request.model.clone(),
            messages: request.wire_messages(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::new(NAME, request.model.clone(), format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(
                ProviderError::new(NAME, request.model.clone(), format!("API error: {}", body))
                    .with_status(status.as_u16()),
            );
        }
        Ok(response)
    }
}

/// Decode one line of a server-sent event stream.
fn parse_sse_line(line: &str) -> Result<LineEvent, String> {
    let Some(data) = line.strip_prefix("data:") else {
        // Blank separators, comments and other SSE fields carry no text.
        return Ok(LineEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(LineEvent::Done);
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| format!("Failed to parse stream chunk: {e}"))?;
    if let Some(error) = chunk.error {
        return Err(error.message);
    }
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(content) if !content.is_empty() => Ok(LineEvent::Fragment(content)),
        _ => Ok(LineEvent::Skip),
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let response = self.send(&request, false).await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let openai_response: OpenAIResponse = response.json().await.map_err(|e| {
            ProviderError::new(NAME, request.model.clone(), format!("Failed to parse response: {}", e))
        })?;

        let first = openai_response.choices.into_iter().next();
        let finish_reason = first.as_ref().and_then(|c| c.finish_reason.clone());
        let content = first.and_then(|c| c.message.content).unwrap_or_default();
        let usage = openai_response.usage.unwrap_or_default();

        Ok(ChatResponse {
            provider: NAME.into(),
            model: openai_response.model.unwrap_or(request.model),
            content,
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            finish_reason,
            latency_ms,
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError> {
        let response = self.send(&request, true).await?;
        Ok(fragment_stream(response, NAME, request.model, parse_sse_line))
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let provider = OpenAIProvider::with_base_url("k", "http://localhost:8080/", Duration::from_secs(5));
        assert_eq!(provider.base_url, "http://localhost:8080");
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn test_openai_request_serialization() {
        let request = OpenAIRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![
                ChatMessage::new("system", "Be helpful"),
                ChatMessage::new("user", "Hello"),
            ],
            max_tokens: Some(1000),
            temperature: Some(0.7),
            stream: true,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("gpt-4o-mini"));
        assert!(json.contains("Be helpful"));
        assert!(json.contains("\"stream\":true"));
    }

    #[test]
    fn test_sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            Ok(LineEvent::Fragment("Hi".into()))
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            Ok(LineEvent::Skip)
        );
        assert_eq!(parse_sse_line("data: [DONE]"), Ok(LineEvent::Done));
        assert_eq!(parse_sse_line(""), Ok(LineEvent::Skip));
        assert_eq!(parse_sse_line(": keep-alive"), Ok(LineEvent::Skip));
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"overloaded"}}"#),
            Err("overloaded".to_string())
        );
    }

    #[test]
    fn test_fragment_whitespace_preserved() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":" world"}}]}"#),
            Ok(LineEvent::Fragment(" world".into()))
        );
    }
}
