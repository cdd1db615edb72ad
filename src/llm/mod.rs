//! LLM client abstraction.
//!
//! The [`LlmClient`] trait is the seam between the orchestrator and a
//! provider's wire protocol. Two implementations ship with the crate:
//!
//! - [`OpenAiProvider`] for OpenAI-compatible chat completion endpoints
//! - [`ClaudeProvider`] for the Anthropic messages API
//!
//! Which one is used is decided by [`router::select_provider`] from the
//! configured credentials. Clients never retry; a failed call surfaces a
//! typed error and the orchestrator stops the cycle at that stage.
//!
//! # Example
//!
//! ```rust,ignore
//! use qtcov::llm::{generate, LlmClient};
//! use qtcov::prompt::PromptAssembler;
//!
//! async fn run(client: &dyn LlmClient) -> qtcov::Result<String> {
//!     let generated = generate(client, &PromptAssembler::default(), "tests for X", None, &[]).await?;
//!     Ok(generated.text)
//! }
//! ```

pub mod claude;
pub mod openai;
pub mod router;

pub use claude::ClaudeProvider;
pub use openai::OpenAiProvider;
pub use router::{select_provider, ProviderKind, ProviderProbe, ProviderSelection};

use crate::config::LlmConfig;
use crate::error::{QtcovError, Result};
use crate::prompt::{AssembledPrompt, ContextSnippet, PromptAssembler};
use async_trait::async_trait;
use tracing::{debug, info};

/// Trait for LLM providers.
///
/// Implementations send one request and return the answer text. They must
/// not write files and must not retry.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send `prompt` with an optional system prompt.
    ///
    /// # Errors
    ///
    /// [`QtcovError::Auth`] without a credential, [`QtcovError::Provider`]
    /// on a non-2xx status or unusable body, [`QtcovError::Timeout`] when the
    /// request deadline elapses.
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> Result<String>;

    /// Which wire protocol this client speaks.
    fn provider(&self) -> ProviderKind;

    /// Model identifier sent with each request.
    fn model_name(&self) -> &str;
}

/// Answer text together with the prompt that produced it.
#[derive(Debug, Clone)]
pub struct GeneratedText {
    pub text: String,
    pub prompt: AssembledPrompt,
}

/// Assemble the full prompt from its parts and send it.
pub async fn generate(
    client: &dyn LlmClient,
    assembler: &PromptAssembler,
    prompt: &str,
    system_prompt: Option<&str>,
    context: &[ContextSnippet],
) -> Result<GeneratedText> {
    let assembled = assembler.assemble(prompt, system_prompt, context);
    info!(
        "Requesting test generation from {} ({}): {} context files, {} chars",
        client.provider(),
        client.model_name(),
        assembled.included.len(),
        assembled.text.chars().count()
    );
    if assembled.dropped > 0 || assembled.truncated {
        debug!(
            "Context limited: {} files dropped, truncated: {}",
            assembled.dropped, assembled.truncated
        );
    }

    let text = client.complete(system_prompt, &assembled.text).await?;
    debug!("Received {} chars from {}", text.len(), client.provider());
    Ok(GeneratedText {
        text,
        prompt: assembled,
    })
}

/// Build the client for `kind` from configuration.
pub fn create_client(kind: ProviderKind, config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match kind {
        ProviderKind::OpenAi => {
            let key = config.api_key.clone().ok_or_else(|| QtcovError::Auth {
                provider: kind.to_string(),
            })?;
            Ok(Box::new(
                OpenAiProvider::new(&config.model, key)
                    .with_api_base(&config.base_url)
                    .with_timeout(config.timeout_secs)
                    .with_max_tokens(config.max_tokens)
                    .with_temperature(config.temperature),
            ))
        }
        ProviderKind::Claude => {
            let key = config
                .anthropic_api_key
                .clone()
                .ok_or_else(|| QtcovError::Auth {
                    provider: kind.to_string(),
                })?;
            Ok(Box::new(
                ClaudeProvider::new(&config.anthropic_model, key)
                    .with_api_base(&config.anthropic_base_url)
                    .with_timeout(config.timeout_secs)
                    .with_max_tokens(config.max_tokens)
                    .with_temperature(config.temperature),
            ))
        }
    }
}

/// Resolve `selection` against the configured credentials and build the client.
pub fn client_for_selection(
    selection: ProviderSelection,
    config: &LlmConfig,
) -> Result<Box<dyn LlmClient>> {
    let probes = ProviderProbe::from_config(config);
    let kind = select_provider(selection, &probes)?;
    info!("Using LLM provider {}", kind);
    create_client(kind, config)
}

/// Error message from a provider error body.
///
/// Both supported APIs answer errors as `{"error": {"message": ...}}`; any
/// other body is reported as an excerpt.
pub(crate) fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| excerpt(body, 500))
}

/// Map a transport failure to a timeout or provider error.
pub(crate) fn map_transport_error(
    provider: &str,
    timeout_secs: u64,
    error: reqwest::Error,
) -> QtcovError {
    if error.is_timeout() {
        QtcovError::timeout(format!("{} request", provider), timeout_secs)
    } else {
        QtcovError::provider(provider, None, format!("connection error: {}", error))
    }
}

/// Cut a response body down for error messages.
pub(crate) fn excerpt(body: &str, max: usize) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max).collect();
        format!("{}...", cut)
    }
}

/// One-shot local HTTP endpoint for provider tests.
#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer the first request on a local port with `status` and a JSON
    /// `body`. Returns the base URL.
    pub async fn respond_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }
}
