//! Anthropic messages API provider.

use crate::error::{QtcovError, Result};
use crate::llm::{api_error_message, map_transport_error, LlmClient, ProviderKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// API version header sent with every request.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

impl MessagesResponse {
    fn text(self) -> String {
        self.content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Claude-compatible provider.
#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    model: String,
    api_key: String,
    api_base: String,
    timeout_secs: u64,
    max_tokens: u32,
    temperature: f32,
}

impl ClaudeProvider {
    pub const DEFAULT_API_BASE: &'static str = "https://api.anthropic.com";

    pub fn new(model: &str, api_key: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            api_key: api_key.into(),
            api_base: Self::DEFAULT_API_BASE.to_string(),
            timeout_secs: 300,
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

    /// Messages endpoint for the configured base.
    pub fn endpoint(&self) -> String {
        let base = self.api_base.trim().trim_end_matches('/');
        if base.ends_with("/v1/messages") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/messages", base)
        } else {
            format!("{}/v1/messages", base)
        }
    }

    fn request_body<'a>(&'a self, system_prompt: Option<&'a str>, prompt: &'a str) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: system_prompt.filter(|s| !s.trim().is_empty()),
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        }
    }
}

#[async_trait]
impl LlmClient for ClaudeProvider {
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> Result<String> {
        let provider = ProviderKind::Claude.to_string();
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
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

        let parsed: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
            QtcovError::provider(&provider, Some(status.as_u16()), format!("invalid response: {}", e))
        })?;
        let text = parsed.text();
        if text.trim().is_empty() {
            return Err(QtcovError::provider(
                &provider,
                Some(status.as_u16()),
                "response contained no text",
            ));
        }
        Ok(text)
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
