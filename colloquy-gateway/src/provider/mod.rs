//! Model provider abstraction.
//!
//! A provider answers a chat request either in one piece (`chat`) or as a
//! stream of text fragments (`chat_stream`). Streaming backends frame their
//! output as lines (NDJSON for Ollama, SSE for OpenAI-compatible servers), so
//! the shared line splitter and fragment decoder live here.

mod ollama;
mod openai;
mod resilient;

pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;
pub use resilient::{ResilienceConfig, ResilientProvider};

use async_trait::async_trait;
use colloquy_common::{ModelConfig, ProviderKind};
use colloquy_store::TokenUsage;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lazily produced text fragments of one assistant response.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

// ============================================================================
// Provider Trait
// ============================================================================

/// Unified interface for model backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Send a chat completion request and wait for the whole answer.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Open a streaming chat completion.
    ///
    /// An `Err` here means the stream could not be established. Failures after
    /// that arrive as `Err` items on the stream.
    async fn chat_stream(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError>;
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Client errors other than rate limiting will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self.status_code {
            Some(429) => true,
            Some(code) => !(400..500).contains(&code),
            None => true,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Unified chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model to use
    pub model: String,
    /// Messages in the conversation
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// System instruction sent ahead of the messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// A message as sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

impl ChatRequest {
    /// Role-tagged messages with the system instruction, if any, in front.
    pub(crate) fn wire_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::new("system", system.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

/// Unified chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Provider name
    pub provider: String,
    /// Model used
    pub model: String,
    /// Response content
    pub content: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Finish reason
    pub finish_reason: Option<String>,
    /// Response latency in milliseconds
    pub latency_ms: u64,
}

// ============================================================================
// Stream framing
// ============================================================================

/// Outcome of decoding one line of a streaming response.
#[derive(Debug, PartialEq)]
pub(crate) enum LineEvent {
    Fragment(String),
    Skip,
    Done,
}

/// Split a byte stream into `\n`-terminated lines.
///
/// Bytes are buffered until a full line is present so multi-byte characters
/// split across chunks are reassembled before decoding.
pub(crate) fn split_lines<S, B, E>(bytes: S) -> BoxStream<'static, Result<String, E>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    let state = (bytes.boxed(), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut bytes, mut buf, mut eof)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let text = decode_line(&line[..line.len() - 1]);
                return Some((Ok(text), (bytes, buf, eof)));
            }
            if eof {
                if buf.is_empty() {
                    return None;
                }
                let text = decode_line(&buf);
                buf.clear();
                return Some((Ok(text), (bytes, buf, eof)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(e), (bytes, buf, true)));
                }
                None => eof = true,
            }
        }
    })
    .boxed()
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

/// Turn a line stream into fragments using a backend-specific line decoder.
///
/// The stream must end with an explicit completion line; running out of
/// input before that is reported as an error.
pub(crate) fn fragment_stream(
    response: reqwest::Response,
    provider: &'static str,
    model: String,
    parse: fn(&str) -> Result<LineEvent, String>,
) -> FragmentStream {
    let lines = split_lines(response.bytes_stream());
    decode_fragments(lines, provider, model, parse)
}

pub(crate) fn decode_fragments<E: std::fmt::Display + Send + 'static>(
    lines: BoxStream<'static, Result<String, E>>,
    provider: &'static str,
    model: String,
    parse: fn(&str) -> Result<LineEvent, String>,
) -> FragmentStream {
    stream::unfold(Some(lines), move |state| {
        let model = model.clone();
        async move {
            let mut lines = state?;
            loop {
                let error = match lines.next().await {
                    Some(Ok(line)) => match parse(&line) {
                        Ok(LineEvent::Fragment(text)) => return Some((Ok(text), Some(lines))),
                        Ok(LineEvent::Skip) => continue,
                        Ok(LineEvent::Done) => return None,
                        Err(message) => message,
                    },
                    Some(Err(e)) => format!("Stream interrupted: {e}"),
                    None => "Stream ended before completion".to_string(),
                };
                return Some((Err(ProviderError::new(provider, model, error)), None));
            }
        }
    })
    .boxed()
}

// ============================================================================
// Construction
// ============================================================================

/// Build the configured provider wrapped with retries.
pub fn create_provider(config: &ModelConfig) -> Arc<dyn Provider> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let inner: Arc<dyn Provider> = match config.provider {
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(config.base_url.as_deref(), timeout)),
        ProviderKind::OpenAI => {
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or(OpenAIProvider::DEFAULT_BASE_URL);
            Arc::new(OpenAIProvider::with_base_url(
                config.api_key.clone().unwrap_or_default(),
                base_url,
                timeout,
            ))
        }
    };

    tracing::info!(
        provider = inner.name(),
        model = %config.model,
        max_retries = config.max_retries,
        "Model provider configured"
    );

    Arc::new(ResilientProvider::new(
        inner,
        ResilienceConfig {
            max_retries: config.max_retries,
            base_backoff_ms: config.base_backoff_ms,
            ..ResilienceConfig::default()
        },
    ))
}
