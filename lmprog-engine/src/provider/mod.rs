//! # LLM Provider Interface
//!
//! Async wire clients for the oracles program units talk to.
//!
//! ## Design
//! - `LlmProvider` is the async core interface; the synchronous
//!   [`InferenceBackend`](crate::backend::InferenceBackend) adapts it
//! - `ProviderType` names the wire protocol and carries its defaults
//!   (endpoint, model, key variable, timeout)
//! - Messages carry plain text or ordered text/image parts
//! - Every HTTP failure is mapped once, in [`send_json`], onto `ProviderError`

pub mod openai;
pub mod anthropic;
pub mod server;

pub use openai::OpenAIProvider;
pub use anthropic::AnthropicProvider;
pub use server::ServerProvider;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// Message body: a plain string, or ordered parts when images are attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Units only ever send a system message and one user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
        }
    }
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// User turn: the text first, then each image data URL in order.
    pub fn user_with_images(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        let parts = std::iter::once(ContentPart::Text { text: text.into() })
            .chain(image_urls.into_iter().map(|url| ContentPart::ImageUrl { image_url: ImageUrl { url } }))
            .collect();
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// Text parts joined with newlines; images are skipped.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Sampling parameters are optional; providers omit whatever is unset.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Empty stop lists are not sent.
    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = (!stop.is_empty()).then_some(stop);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    /// One entry per returned choice, in the order the backend sent them.
    pub choices: Vec<String>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl CompletionResponse {
    /// Text of the first choice
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown,
}

impl FinishReason {
    pub(crate) fn parse(reason: Option<&str>) -> Self {
        match reason {
            Some("stop" | "end_turn" | "stop_sequence") => FinishReason::Stop,
            Some("length" | "max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Usage {
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Running token totals of one backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTracker {
    pub calls: usize,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl UsageTracker {
    pub fn record(&mut self, usage: &Usage) {
        self.calls += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
    }

    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ProviderError {
    /// Connection failed, timed out, or the server is not ready yet
    Network(String),
    /// Non-success status without a more specific mapping
    Api { status: u16, message: String },
    /// Success status with an unreadable body
    Parse(String),
    RateLimited { retry_after: Option<u64> },
    InvalidRequest(String),
    ModelNotFound(String),
    AuthenticationFailed,
    Other(String),
}

impl ProviderError {
    /// Throttling and connectivity failures; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "network: {}", e),
            Self::Api { status, message } => write!(f, "status {}: {}", status, message),
            Self::Parse(e) => write!(f, "unreadable response: {}", e),
            Self::RateLimited { retry_after: Some(secs) } => write!(f, "rate limited, retry after {}s", secs),
            Self::RateLimited { retry_after: None } => f.write_str("rate limited"),
            Self::InvalidRequest(e) => write!(f, "invalid request: {}", e),
            Self::ModelNotFound(m) => write!(f, "model not found: {}", m),
            Self::AuthenticationFailed => f.write_str("authentication failed"),
            Self::Other(e) => f.write_str(e),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Map a non-success HTTP status onto a provider error.
///
/// 529 (overloaded) throttles like 429; 502-504 mean the server is not
/// reachable yet.
pub(crate) fn status_error(status: u16, message: String, retry_after: Option<u64>) -> ProviderError {
    match status {
        429 | 529 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::AuthenticationFailed,
        404 => ProviderError::ModelNotFound(message),
        400 | 422 => ProviderError::InvalidRequest(message),
        502..=504 => ProviderError::Network(format!("server unavailable ({})", status)),
        _ => ProviderError::Api { status, message },
    }
}

fn retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Send `request` and decode a JSON success body.
pub(crate) async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, ProviderError> {
    let response = request.send().await.map_err(|e| ProviderError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let retry = retry_after(&response);
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(status.as_u16(), text, retry));
    }

    response.json().await.map_err(|e| ProviderError::Parse(e.to_string()))
}

// ============================================================================
// Provider Trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logs (e.g. "openai", "server")
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Wire protocol of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    OpenAI,
    Anthropic,
    /// OpenAI-compatible endpoint serving a local causal model
    Local,
    /// Batched `/v1/completions` server
    Server,
}

impl ProviderType {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Local => "local",
            ProviderType::Server => "server",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "https://api.openai.com/v1",
            ProviderType::Anthropic => "https://api.anthropic.com/v1",
            ProviderType::Local => "http://localhost:8000/v1",
            ProviderType::Server => "http://localhost:8000",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "gpt-4o",
            ProviderType::Anthropic => "claude-sonnet-4-20250514",
            ProviderType::Local => "local",
            ProviderType::Server => "default",
        }
    }

    /// Environment variable holding the API key. Self-hosted endpoints need none.
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderType::OpenAI => Some("OPENAI_API_KEY"),
            ProviderType::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderType::Local | ProviderType::Server => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider_type: ProviderType,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ProviderConfig {
    /// Defaults for `provider_type`; self-hosted endpoints get a longer timeout.
    pub fn new(provider_type: ProviderType) -> Self {
        let (headers, timeout_secs) = match provider_type {
            ProviderType::Anthropic => (vec![("anthropic-version".to_string(), "2023-06-01".to_string())], 120),
            ProviderType::OpenAI => (Vec::new(), 120),
            ProviderType::Local | ProviderType::Server => (Vec::new(), 300),
        };
        Self {
            provider_type,
            api_key: None,
            base_url: provider_type.default_base_url().to_string(),
            model: provider_type.default_model().to_string(),
            headers,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub(crate) fn client(&self) -> Result<reqwest::Client, ProviderError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to create HTTP client: {}", e)))
    }

    pub(crate) fn endpoint(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route)
    }

    /// `request` with every configured extra header attached
    pub(crate) fn decorate(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        request
    }
}
