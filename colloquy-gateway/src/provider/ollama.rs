//! Ollama provider.
//!
//! Talks to a local or remote Ollama server through `/api/chat`. Streaming
//! responses arrive as one JSON object per line, the last one carrying
//! `"done": true`.

use super::{fragment_stream, ChatMessage, ChatRequest, ChatResponse, FragmentStream, LineEvent, Provider, ProviderError};
use async_trait::async_trait;
use colloquy_store::TokenUsage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const NAME: &str = "ollama";

/// Ollama provider for local models.
pub struct OllamaProvider {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<i64>,
    #[serde(default)]
    eval_count: Option<i64>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaProvider {
    /// Create a new Ollama provider.
    ///
    /// # Arguments
    /// * `base_url` - Base URL for Ollama API (defaults to http://localhost:11434)
    /// * `timeout` - Whole-request timeout; local models can be slow
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OllamaChatRequest {
        OllamaChatRequest {
            model: request.model.clone(),
            messages: request.wire_messages(),
            stream,
            options: OllamaOptions {
                temperature: request.temperature.unwrap_or(0.7),
                num_predict: request.max_tokens,
            },
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_request(request, stream);

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            ProviderError::new(
                NAME,
                request.model.clone(),
                format!("Request failed: {}. Is Ollama running at {}?", e, self.base_url),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                NAME,
                request.model.clone(),
                format!("API error ({}): {}", status.as_u16(), error_text),
            )
            .with_status(status.as_u16()));
        }
        Ok(response)
    }
}

/// Decode one NDJSON line of a streaming `/api/chat` response.
fn parse_stream_line(line: &str) -> Result<LineEvent, String> {
    if line.trim().is_empty() {
        return Ok(LineEvent::Skip);
    }
    let chunk: OllamaChatResponse =
        serde_json::from_str(line).map_err(|e| format!("Failed to parse stream chunk: {e}"))?;
    if let Some(error) = chunk.error {
        return Err(error);
    }

    // The closing object carries statistics, not text.
    if chunk.done {
        return Ok(LineEvent::Done);
    }
    match chunk.message.map(|m| m.content) {
        Some(content) if !content.is_empty() => Ok(LineEvent::Fragment(content)),
        _ => Ok(LineEvent::Skip),
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let response = self.send(&request, false).await?;

        let result: OllamaChatResponse = response.json().await.map_err(|e| {
            ProviderError::new(NAME, request.model.clone(), format!("Failed to parse response: {}", e))
        })?;
        if let Some(error) = result.error {
            return Err(ProviderError::new(NAME, request.model, error));
        }

        let input_tokens = result.prompt_eval_count.unwrap_or(0);
        let output_tokens = result.eval_count.unwrap_or(0);

        Ok(ChatResponse {
            provider: NAME.into(),
            model: request.model,
            content: result.message.map(|m| m.content).unwrap_or_default(),
            usage: TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
            },
            finish_reason: result.done_reason,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError> {
        let response = self.send(&request, true).await?;
        Ok(fragment_stream(response, NAME, request.model, parse_stream_line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(url: Option<&str>) -> OllamaProvider {
        OllamaProvider::new(url, Duration::from_secs(5))
    }

    #[test]
    fn default_url() {
        assert_eq!(provider(None).base_url, "http://localhost:11434");
    }

    #[test]
    fn custom_url_trailing_slash() {
        let p = provider(Some("http://192.168.1.100:11434/"));
        assert_eq!(p.base_url, "http://192.168.1.100:11434");
    }

    #[test]
    fn request_serializes_with_system() {
        let p = provider(None);
        let req = p.build_request(
            &ChatRequest {
                model: "llama3".into(),
                messages: vec![ChatMessage::new("user", "hello")],
                max_tokens: None,
                temperature: None,
                system: Some("You are a helpful assistant".into()),
            },
            true,
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"stream\":true"));
        assert!(json.contains("\"role\":\"system\""));
        assert!(json.contains("\"temperature\":0.7"));
        assert!(!json.contains("num_predict"));
    }

    #[test]
    fn response_deserializes() {
        let json = r#"{"message":{"role":"assistant","content":"Hello from Ollama!"},"done":true,"prompt_eval_count":10,"eval_count":5}"#;
        let resp: OllamaChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.message.unwrap().content, "Hello from Ollama!");
        assert_eq!(resp.prompt_eval_count, Some(10));
        assert_eq!(resp.eval_count, Some(5));
    }

    #[test]
    fn stream_lines() {
        assert_eq!(
            parse_stream_line(r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#),
            Ok(LineEvent::Fragment("Hel".into()))
        );
        assert_eq!(
            parse_stream_line(r#"{"message":{"role":"assistant","content":""},"done":false}"#),
            Ok(LineEvent::Skip)
        );
        assert_eq!(
            parse_stream_line(r#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":3}"#),
            Ok(LineEvent::Done)
        );
        assert_eq!(parse_stream_line("   "), Ok(LineEvent::Skip));
        assert_eq!(
            parse_stream_line(r#"{"error":"model 'llama9' not found"}"#),
            Err("model 'llama9' not found".to_string())
        );
        assert!(parse_stream_line("not json").is_err());
    }
}
