//! Retry wrapper for providers.
//!
//! Failed calls are retried with exponential backoff. For streaming calls only
//! establishing the stream is retried: once fragments have been handed out a
//! retry would duplicate text, so mid-stream failures pass through unchanged.

use super::{ChatRequest, ChatResponse, FragmentStream, Provider, ProviderError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubles with each retry).
    pub base_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

/// A provider that retries its inner provider with exponential backoff.
pub struct ResilientProvider {
    inner: Arc<dyn Provider>,
    config: ResilienceConfig,
}

impl ResilientProvider {
    pub fn new(inner: Arc<dyn Provider>, config: ResilienceConfig) -> Self {
        Self { inner, config }
    }

    /// Calculate backoff delay for a given attempt.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.config.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let provider_name = self.inner.name();
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = provider_name,
                            attempt = attempt + 1,
                            "Provider recovered after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.config.max_retries && e.is_retryable() => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        provider = provider_name,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Provider for ResilientProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.with_retries(|| self.inner.chat(request.clone())).await
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<FragmentStream, ProviderError> {
        self.with_retries(|| self.inner.chat_stream(request.clone())).await
    }
}
