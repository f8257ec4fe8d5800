//! Client for the text-completion RPC
//!
//! The model behind this endpoint is opaque to the daemon: it takes a
//! prompt and returns text. Transient failures (timeouts, 5xx) are
//! retried with a doubling backoff; attempt count and initial wait come
//! from [`CompletionConfiguration`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::config::CompletionConfiguration;

/// Backoff never grows past this, however many attempts are configured.
const BACKOFF_CEILING: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("failed to parse completion response: {0}")]
    Parse(String),

    #[error("completion API key is not configured")]
    MissingKey,
}

pub type CompletionResult<T> = Result<T, CompletionError>;

impl CompletionError {
    /// Only failures the next attempt could plausibly survive.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::Timeout | CompletionError::Server { status: 500..=599, .. }
        )
    }
}

/// Seam for the opaque text-completion RPC. Production uses
/// [`CompletionClient`]; tests substitute a scripted backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> CompletionResult<String>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Chat-completions client for the configured endpoint.
pub struct CompletionClient {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfiguration) -> CompletionResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(CompletionError::MissingKey)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key,
            model: config.model.clone(),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        })
    }

    async fn request_once(&self, prompt: &str) -> CompletionResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Request(e)
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CompletionError::Authentication(
                "invalid completion API key".to_string(),
            ));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CompletionError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Parse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CompletionError::Parse("response carried no choices".to_string()))
    }
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    async fn complete(&self, prompt: &str) -> CompletionResult<String> {
        let mut wait = self.initial_backoff;
        let mut attempts_left = self.max_attempts;

        loop {
            attempts_left -= 1;
            let error = match self.request_once(prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            if attempts_left == 0 || !error.is_retryable() {
                return Err(error);
            }

            warn!(
                "Completion request failed ({}); {} attempt(s) left, sleeping {:?}",
                error, attempts_left, wait
            );
            tokio::time::sleep(wait).await;
            wait = std::cmp::min(wait.saturating_mul(2), BACKOFF_CEILING);
        }
    }
}

/// Backend used when no API key is configured: every call fails with a
/// clear error, so spawns fail fast instead of hanging.
pub struct UnconfiguredBackend;

#[async_trait]
impl CompletionBackend for UnconfiguredBackend {
    async fn complete(&self, _prompt: &str) -> CompletionResult<String> {
        Err(CompletionError::MissingKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key() -> CompletionConfiguration {
        CompletionConfiguration {
            api_key: Some("key".to_string()),
            ..CompletionConfiguration::default()
        }
    }

    #[test]
    fn test_missing_key_rejected() {
        let config = CompletionConfiguration {
            api_key: None,
            ..CompletionConfiguration::default()
        };
        assert!(matches!(
            CompletionClient::new(&config),
            Err(CompletionError::MissingKey)
        ));

        // An empty key is as good as none.
        let config = CompletionConfiguration {
            api_key: Some(String::new()),
            ..CompletionConfiguration::default()
        };
        assert!(matches!(
            CompletionClient::new(&config),
            Err(CompletionError::MissingKey)
        ));
    }

    #[test]
    fn test_retry_settings_come_from_config() {
        let config = CompletionConfiguration {
            max_attempts: 7,
            initial_backoff_ms: 40,
            ..config_with_key()
        };
        let client = CompletionClient::new(&config).unwrap();
        assert_eq!(client.max_attempts, 7);
        assert_eq!(client.initial_backoff, Duration::from_millis(40));
    }

    #[test]
    fn test_zero_attempts_clamps_to_one() {
        let config = CompletionConfiguration {
            max_attempts: 0,
            ..config_with_key()
        };
        let client = CompletionClient::new(&config).unwrap();
        assert_eq!(client.max_attempts, 1);
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(CompletionError::Timeout.is_retryable());
        assert!(CompletionError::Server { status: 503, message: String::new() }.is_retryable());
        assert!(!CompletionError::Server { status: 400, message: String::new() }.is_retryable());
        assert!(!CompletionError::Authentication("nope".into()).is_retryable());
        assert!(!CompletionError::Parse("garbled".into()).is_retryable());
    }

    #[test]
    fn test_chat_response_parsing() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"FROM ubuntu:24.04"}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content, "FROM ubuntu:24.04");
    }
}
