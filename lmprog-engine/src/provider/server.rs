//! Batched inference server provider
//!
//! Talks to a vLLM-style `/v1/completions` endpoint: a list of prompts goes
//! in, one completion per prompt comes back.

use super::openai::TokenCounts;
use super::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub struct ServerProvider {
    client: Client,
    config: ProviderConfig,
}

impl ServerProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = config.client()?;
        Ok(Self { client, config })
    }

    /// Send a batch of prompts; the reply holds one text per prompt, ordered by index.
    pub async fn complete_batch(
        &self,
        prompts: &[String],
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = BatchRequest {
            model: request.model.as_deref().unwrap_or(&self.config.model),
            prompt: prompts,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_tokens: request.max_tokens,
            stop: request.stop.as_deref(),
        };

        let http = self.client.post(self.config.endpoint("v1/completions")).json(&body);
        let mut reply: BatchResponse = send_json(self.config.decorate(http)).await?;

        reply.choices.sort_by_key(|c| c.index);
        let finish_reason = FinishReason::parse(reply.choices.first().and_then(|c| c.finish_reason.as_deref()));

        Ok(CompletionResponse {
            id: reply.id,
            model: reply.model,
            choices: reply.choices.into_iter().map(|c| c.text).collect(),
            finish_reason,
            usage: reply.usage.map(Usage::from).unwrap_or_default(),
        })
    }
}

impl LlmProvider for ServerProvider {
    fn name(&self) -> &str {
        "server"
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    /// The conversation is flattened into the only prompt of a one-element batch.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let prompt = request
            .messages
            .iter()
            .map(ChatMessage::text)
            .collect::<Vec<_>>()
            .join("\n\n");
        self.complete_batch(&[prompt], &request).await
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    model: &'a str,
    prompt: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<BatchChoice>,
    usage: Option<TokenCounts>,
}

#[derive(Debug, Deserialize)]
struct BatchChoice {
    #[serde(default)]
    index: usize,
    text: String,
    finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(uri: String) -> ServerProvider {
        ServerProvider::new(ProviderConfig::new(ProviderType::Server).with_base_url(uri).with_model("llama")).unwrap()
    }

    #[tokio::test]
    async fn test_batch_choices_are_ordered_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .and(body_partial_json(serde_json::json!({ "model": "llama", "prompt": ["a", "b"], "top_k": 50 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-7",
                "model": "llama",
                "choices": [
                    { "index": 1, "text": "second", "finish_reason": "stop" },
                    { "index": 0, "text": "first", "finish_reason": "length" }
                ],
                "usage": { "prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6 }
            })))
            .mount(&server)
            .await;

        let request = CompletionRequest::default().with_top_k(50);
        let response = provider(server.uri())
            .complete_batch(&["a".into(), "b".into()], &request)
            .await
            .unwrap();

        assert_eq!(response.choices, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.usage.total_tokens(), 6);
    }

    #[tokio::test]
    async fn test_unavailable_server_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(server.uri())
            .complete(CompletionRequest::new(vec![ChatMessage::user("x")]))
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }
}
