//! Anthropic Claude provider implementation

use super::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Anthropic Claude provider
pub struct AnthropicProvider {
    client: Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = config.client()?;
        Ok(Self { client, config })
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let api_key = self.config.api_key.as_deref().ok_or(ProviderError::AuthenticationFailed)?;

        // the system prompt travels outside the message list
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(ChatMessage::text)
            .reduce(|a, b| format!("{}\n{}", a, b));
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(AnthropicMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let body = AnthropicRequest {
            model: request.model.as_deref().unwrap_or(&self.config.model),
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(4096),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: request.stop.as_deref(),
        };

        let http = self
            .client
            .post(self.config.endpoint("messages"))
            .header("x-api-key", api_key)
            .json(&body);
        let reply: AnthropicResponse = send_json(self.config.decorate(http)).await?;

        let text: String = reply
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect();

        Ok(CompletionResponse {
            id: reply.id,
            model: reply.model,
            choices: vec![text],
            finish_reason: FinishReason::parse(reply.stop_reason.as_deref()),
            usage: Usage {
                prompt_tokens: reply.usage.input_tokens,
                completion_tokens: reply.usage.output_tokens,
            },
        })
    }
}

// ============================================================================
// Anthropic API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    r#type: &'static str,
    media_type: String,
    data: String,
}

impl ImageSource {
    /// Split a `data:<media>;base64,<payload>` URL
    fn from_data_url(url: &str) -> Result<Self, ProviderError> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| ProviderError::InvalidRequest("image must be a data URL".into()))?;
        let (media_type, data) = rest
            .split_once(";base64,")
            .ok_or_else(|| ProviderError::InvalidRequest("image data URL is not base64".into()))?;
        Ok(Self {
            r#type: "base64",
            media_type: media_type.to_string(),
            data: data.to_string(),
        })
    }
}

impl TryFrom<&ChatMessage> for AnthropicMessage {
    type Error = ProviderError;

    fn try_from(msg: &ChatMessage) -> Result<Self, Self::Error> {
        let content = match &msg.content {
            MessageContent::Text(text) => AnthropicContent::Text(text.clone()),
            MessageContent::Parts(parts) => AnthropicContent::Blocks(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => Ok(AnthropicContentBlock::Text { text: text.clone() }),
                        ContentPart::ImageUrl { image_url } => Ok(AnthropicContentBlock::Image {
                            source: ImageSource::from_data_url(&image_url.url)?,
                        }),
                    })
                    .collect::<Result<_, ProviderError>>()?,
            ),
        };

        Ok(Self { role: "user", content })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: usize,
    output_tokens: usize,
}
