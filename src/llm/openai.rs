//! OpenAI-compatible chat completions provider.
//!
//! Works against api.openai.com as well as any server exposing the same
//! `/v1/chat/completions` contract (Azure proxies, local inference servers).
//!
//! # Example
//!
//! ```rust,ignore
//! use qtcov::llm::{LlmClient, OpenAiProvider};
//!
//! let provider = OpenAiProvider::new("gpt-4o", api_key)
//!     .with_api_base("http://localhost:8080/v1")
//!     .with_timeout(120);
//! let answer = provider.complete(None, "Hello!").await?;
//! ```

use crate::error::{QtcovError, Result};
use crate::llm::{api_error_message, map_transport_error, LlmClient, ProviderKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

// =============================================================================
// Provider
// =============================================================================

/// OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    model: String,
    api_key: String,
    api_base: String,
    timeout_secs: u64,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiProvider {
    pub const DEFAULT_API_BASE: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

    pub fn new(model: &str, api_key: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            api_key: api_key.into(),
            api_base: Self::DEFAULT_API_BASE.to_string(),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            max_tokens: 8000,
            temperature: 0.2,
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.to_string();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Full endpoint URL for the configured base.
    pub fn endpoint(&self) -> String {
        chat_completions_url(&self.api_base)
    }

    fn request_body<'a>(&'a self, system_prompt: Option<&str>, prompt: &str) -> ChatCompletionRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(system.to_string()),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(prompt.to_string()),
        });
        ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Resolve the chat completions URL for a base URL.
///
/// A base already pointing at `/chat/completions` is kept, a `/v1` base gets
/// the endpoint appended, anything else gets `/v1/chat/completions`.
pub fn chat_completions_url(base: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

#[async_trait]
impl LlmClient for OpenAiProvider {
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> Result<String> {
        let provider = ProviderKind::OpenAi.to_string();
        if self.api_key.trim().is_empty() {
            return Err(QtcovError::Auth { provider });
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| QtcovError::provider(&provider, None, e.to_string()))?;

        let url = self.endpoint();
        debug!("POST {} (model {}, {} chars)", url, self.model, prompt.len());

        let response = http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(system_prompt, prompt))
            .send()
            .await
            .map_err(|e| map_transport_error(&provider, self.timeout_secs, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(&provider, self.timeout_secs, e))?;

        if !status.is_success() {
            return Err(QtcovError::provider(
                &provider,
                Some(status.as_u16()),
                api_error_message(&body),
            ));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            QtcovError::provider(&provider, Some(status.as_u16()), format!("invalid response: {}", e))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                QtcovError::provider(&provider, Some(status.as_u16()), "response contained no text")
            })
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
