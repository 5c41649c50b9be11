//! Chat-completion client.
//!
//! Every exchange is stateless: one system message carrying the user's custom
//! prompt and one user message. No history is kept between exchanges.

use async_trait::async_trait;
use relay_common::config::CompletionConfig;
use relay_common::security::Credential;
use relay_common::{Error, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Longest error body excerpt kept in an error message.
const ERROR_BODY_LIMIT: usize = 200;

/// One message in a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Completion request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    /// Build the two-message exchange for one user turn.
    pub fn exchange(
        model: impl Into<String>,
        max_tokens: u32,
        system_instruction: &str,
        user_message: &str,
    ) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            messages: vec![
                ChatMessage::system(system_instruction),
                ChatMessage::user(user_message),
            ],
        }
    }
}

/// Completion backend.
///
/// Fails with [`Error::BackendTransport`] when the backend cannot be reached or
/// answers with an error status, and [`Error::BackendParse`] when the answer
/// has no readable reply.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        system_instruction: &str,
        user_message: &str,
        credential: &Credential,
    ) -> Result<String>;
}

// ============================================================================
// OpenAI
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiClient {
    /// Create a client from configuration.
    pub fn new(config: &CompletionConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    /// Build the request for one exchange with the configured model.
    pub fn request(&self, system_instruction: &str, user_message: &str) -> CompletionRequest {
        CompletionRequest::exchange(&self.model, self.max_tokens, system_instruction, user_message)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        system_instruction: &str,
        user_message: &str,
        credential: &Credential,
    ) -> Result<String> {
        let start = Instant::now();
        let request = self.request(system_instruction, user_message);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| Error::BackendTransport("API key contains invalid characters".into()))?;
        auth.set_sensitive(true);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, auth)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::BackendTransport(format!("Request failed: {}", e.without_url())))?;

        let status = response.status();
        let latency_ms = start.elapsed().as_millis() as u64;

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            tracing::warn!(status = status.as_u16(), latency_ms, "Completion API returned an error");
            return Err(Error::BackendTransport(format!(
                "API error ({}): {}",
                status.as_u16(),
                excerpt
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::BackendTransport(format!("Failed to read response: {}", e.without_url())))?;

        let parsed: OpenAIResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::BackendParse(format!("Failed to parse response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::BackendParse("Response has no choices[0].message.content".into()))?;

        tracing::debug!(
            model = %request.model,
            latency_ms,
            reply_chars = content.chars().count(),
            "Completion received"
        );

        Ok(content)
    }
}
