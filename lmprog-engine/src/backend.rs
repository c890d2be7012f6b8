//! # Inference Backend
//!
//! The synchronous text-in/text-out contract program units talk to, and the
//! adapter that drives an async [`LlmProvider`] through it.
//!
//! A unit picks its [`BackendKind`] once, at construction. Transient oracle
//! failures (throttling, dropped connections) are retried forever with a fixed
//! delay; every other failure is returned immediately.

use crate::error::{provider_error, Error, Result};
use crate::provider::{ChatMessage, CompletionRequest, LlmProvider, UsageTracker};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

/// System message sent to code-generating chat backends.
pub const PLANNER_SYSTEM_PROMPT: &str =
    "You are a task planning assistant who only answers with rhai code";

/// Extra instruction appended to prompts for local causal models.
pub const LOCAL_MODEL_INSTRUCTION: &str = "\n// Refer to the example tasks, now answer this last task question. \
     Avoid defining new methods as much as possible.";

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Color,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagePhase {
    Before,
    After,
}

/// An encoded frame attached to a multimodal request
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub kind: ImageKind,
    pub phase: ImagePhase,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    pub fn jpeg(kind: ImageKind, phase: ImagePhase, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            phase,
            media_type: "image/jpeg".into(),
            bytes,
        }
    }

    pub fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.media_type,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// The attachment order multimodal backends expect.
pub const IMAGE_ORDER: [(ImageKind, ImagePhase); 4] = [
    (ImageKind::Color, ImagePhase::Before),
    (ImageKind::Depth, ImagePhase::Before),
    (ImageKind::Color, ImagePhase::After),
    (ImageKind::Depth, ImagePhase::After),
];

/// One generation call
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub stop: Vec<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub images: Vec<ImageAttachment>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 512,
            ..Default::default()
        }
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }
}

/// Per-unit sampling options, turned into a [`GenerateRequest`] per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub stop: Vec<String>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            stop: Vec::new(),
            temperature: 0.0,
            max_tokens: 512,
        }
    }
}

impl GenerationOptions {
    pub fn request(&self, prompt: impl Into<String>) -> GenerateRequest {
        GenerateRequest::new(prompt)
            .with_stop(self.stop.clone())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// Blocking text generation. Returns the raw reply, trimmed.
pub trait InferenceBackend {
    fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Rc<B> {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        (**self).generate(request)
    }
}

/// Which oracle family a unit talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Chat completion, stop sequences forwarded
    HostedChatV1,
    /// Chat completion, stop sequences not forwarded
    #[default]
    HostedChatV2,
    /// Chat completion with exactly four attached frames
    HostedMultimodal,
    /// Locally hosted causal model behind an OpenAI-compatible endpoint
    LocalCausalModel,
    /// Batched completions server, one prompt per batch
    BatchedInferenceServer,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::HostedChatV1 => "hosted-chat-v1",
            BackendKind::HostedChatV2 => "hosted-chat-v2",
            BackendKind::HostedMultimodal => "hosted-multimodal",
            BackendKind::LocalCausalModel => "local-causal-model",
            BackendKind::BatchedInferenceServer => "batched-inference-server",
        }
    }

    /// Shape a generation call into a provider request for this family.
    pub fn completion_request(
        &self,
        system_prompt: &str,
        request: &GenerateRequest,
    ) -> Result<CompletionRequest> {
        if *self != BackendKind::HostedMultimodal && !request.images.is_empty() {
            return Err(Error::invalid_argument(format!(
                "backend '{}' does not accept images",
                self.as_str()
            )));
        }

        let system = ChatMessage::system(system_prompt);
        let completion = match self {
            BackendKind::HostedChatV1 => {
                CompletionRequest::new(vec![system, ChatMessage::user(&request.prompt)])
                    .with_stop(request.stop.clone())
                    .with_temperature(request.temperature)
            }
            BackendKind::HostedChatV2 => {
                CompletionRequest::new(vec![system, ChatMessage::user(&request.prompt)])
                    .with_temperature(request.temperature)
            }
            BackendKind::HostedMultimodal => {
                check_image_order(&request.images)?;
                let urls = request.images.iter().map(ImageAttachment::data_url).collect();
                CompletionRequest::new(vec![
                    system,
                    ChatMessage::user_with_images(&request.prompt, urls),
                ])
                .with_temperature(request.temperature)
            }
            BackendKind::LocalCausalModel => {
                let prompt = format!("{}{}", request.prompt, LOCAL_MODEL_INSTRUCTION);
                CompletionRequest::new(vec![system, ChatMessage::user(prompt)])
                    .with_temperature(0.7 + request.temperature)
                    .with_top_p(1.0)
                    .with_top_k(50)
            }
            BackendKind::BatchedInferenceServer => {
                CompletionRequest::new(vec![system, ChatMessage::user(&request.prompt)])
                    .with_temperature(0.8)
                    .with_top_p(0.95)
                    .with_top_k(50)
            }
        };
        Ok(completion.with_max_tokens(request.max_tokens))
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn check_image_order(images: &[ImageAttachment]) -> Result<()> {
    if images.len() != IMAGE_ORDER.len() {
        return Err(Error::invalid_argument(format!(
            "multimodal backend expects {} images, got {}",
            IMAGE_ORDER.len(),
            images.len()
        )));
    }
    for (image, (kind, phase)) in images.iter().zip(IMAGE_ORDER) {
        if image.kind != kind || image.phase != phase {
            return Err(Error::invalid_argument(
                "images must be ordered color-before, depth-before, color-after, depth-after",
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Retry
// ============================================================================

/// Fixed-delay, unbounded retry on transient failures.
#[derive(Clone)]
pub struct RetryPolicy {
    pub delay: Duration,
    pause: Rc<dyn Fn(Duration)>,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pause: Rc::new(std::thread::sleep),
        }
    }

    /// Replace the blocking sleep, e.g. to count delays.
    pub fn with_pause(mut self, pause: impl Fn(Duration) + 'static) -> Self {
        self.pause = Rc::new(pause);
        self
    }

    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    warn!(attempt, error = %err, delay = ?self.delay, "transient inference failure, retrying");
                    (self.pause)(self.delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy").field("delay", &self.delay).finish()
    }
}

// ============================================================================
// Provider adapter
// ============================================================================

/// Drives an async provider from the single-threaded engine.
pub struct ProviderBackend<P: LlmProvider> {
    provider: P,
    kind: BackendKind,
    system_prompt: String,
    retry: RetryPolicy,
    runtime: tokio::runtime::Runtime,
    usage: RefCell<UsageTracker>,
}

impl<P: LlmProvider> ProviderBackend<P> {
    pub fn new(provider: P, kind: BackendKind) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                Error::unexpected("failed to start async runtime")
                    .with_operation("backend::new")
                    .set_source(e)
            })?;
        Ok(Self {
            provider,
            kind,
            system_prompt: PLANNER_SYSTEM_PROMPT.to_string(),
            retry: RetryPolicy::default(),
            runtime,
            usage: RefCell::new(UsageTracker::default()),
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn usage(&self) -> UsageTracker {
        *self.usage.borrow()
    }

    fn attempt(&self, request: &CompletionRequest) -> Result<String> {
        let response = self
            .runtime
            .block_on(self.provider.complete(request.clone()))
            .map_err(|e| {
                provider_error(e)
                    .with_operation("backend::generate")
                    .with_context("backend", self.kind.as_str())
                    .with_context("provider", self.provider.name())
            })?;

        let mut usage = self.usage.borrow_mut();
        usage.record(&response.usage);
        debug!(
            backend = %self.kind,
            calls = usage.calls,
            total_tokens = usage.total_tokens(),
            "usage"
        );
        drop(usage);

        if self.kind == BackendKind::BatchedInferenceServer && response.choices.len() != 1 {
            return Err(Error::inference_failed(format!(
                "expected exactly one completion, got {}",
                response.choices.len()
            ))
            .with_operation("backend::generate"));
        }

        response
            .text()
            .map(|text| text.trim().to_string())
            .ok_or_else(|| Error::inference_failed("no content in response").with_operation("backend::generate"))
    }
}

impl<P: LlmProvider> InferenceBackend for ProviderBackend<P> {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let completion = self.kind.completion_request(&self.system_prompt, request)?;
        debug!(backend = %self.kind, prompt_len = request.prompt.len(), "generate");
        self.retry.run(|| self.attempt(&completion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionResponse, FinishReason, MessageContent, ProviderError, Usage};
    use lmprog_error::ErrorKind;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails with the queued errors first, then answers with `reply`.
    struct ScriptedProvider {
        failures: Mutex<Vec<ProviderError>>,
        calls: AtomicUsize,
        reply: Vec<String>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn new(failures: Vec<ProviderError>, reply: &[&str]) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicUsize::new(0),
                reply: reply.iter().map(|s| s.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request);
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
            Ok(CompletionResponse {
                id: "1".into(),
                model: "stub".into(),
                choices: self.reply.clone(),
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            })
        }
    }

    fn counting_retry(counter: Rc<Cell<usize>>) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10)).with_pause(move |delay| {
            assert_eq!(delay, Duration::from_secs(10));
            counter.set(counter.get() + 1);
        })
    }

    fn frames() -> Vec<ImageAttachment> {
        IMAGE_ORDER
            .iter()
            .map(|(kind, phase)| ImageAttachment::jpeg(*kind, *phase, vec![1, 2, 3]))
            .collect()
    }

    #[test]
    fn test_transient_failures_are_retried_with_fixed_delay() {
        let provider = ScriptedProvider::new(
            vec![
                ProviderError::RateLimited { retry_after: None },
                ProviderError::Network("connection reset".into()),
            ],
            &["  let x = 1;  "],
        );
        let pauses = Rc::new(Cell::new(0));
        let backend = ProviderBackend::new(provider, BackendKind::HostedChatV2)
            .unwrap()
            .with_retry(counting_retry(pauses.clone()));

        let reply = backend.generate(&GenerateRequest::new("bind x")).unwrap();

        assert_eq!(reply, "let x = 1;");
        assert_eq!(pauses.get(), 2);
        assert_eq!(backend.usage().calls, 1);
        assert_eq!(backend.provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_transient_failure_propagates_immediately() {
        let provider = ScriptedProvider::new(vec![ProviderError::AuthenticationFailed], &["unused"]);
        let pauses = Rc::new(Cell::new(0));
        let backend = ProviderBackend::new(provider, BackendKind::HostedChatV1)
            .unwrap()
            .with_retry(counting_retry(pauses.clone()));

        let err = backend.generate(&GenerateRequest::new("x")).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(pauses.get(), 0);
    }

    #[test]
    fn test_stop_sequences_only_forwarded_by_v1() {
        let request = GenerateRequest::new("x").with_stop(vec!["#".into()]);

        let v1 = BackendKind::HostedChatV1.completion_request("sys", &request).unwrap();
        let v2 = BackendKind::HostedChatV2.completion_request("sys", &request).unwrap();

        assert_eq!(v1.stop, Some(vec!["#".to_string()]));
        assert!(v2.stop.is_none());
    }

    #[test]
    fn test_local_model_sampling() {
        let request = GenerateRequest::new("stack blocks").with_temperature(0.1);
        let completion = BackendKind::LocalCausalModel.completion_request("sys", &request).unwrap();

        assert!((completion.temperature.unwrap() - 0.8).abs() < 1e-6);
        assert_eq!(completion.top_p, Some(1.0));
        assert_eq!(completion.top_k, Some(50));
        assert!(completion.messages[1].text().ends_with("Avoid defining new methods as much as possible."));
    }

    #[test]
    fn test_multimodal_requires_four_ordered_frames() {
        let ok = GenerateRequest::new("done?").with_images(frames());
        let completion = BackendKind::HostedMultimodal.completion_request("sys", &ok).unwrap();
        match &completion.messages[1].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 5),
            other => panic!("expected parts, got {:?}", other),
        }

        let mut reversed = frames();
        reversed.reverse();
        let err = BackendKind::HostedMultimodal
            .completion_request("sys", &GenerateRequest::new("done?").with_images(reversed))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let short = GenerateRequest::new("done?").with_images(frames()[..2].to_vec());
        assert!(BackendKind::HostedMultimodal.completion_request("sys", &short).is_err());
    }

    #[test]
    fn test_images_rejected_by_text_backends() {
        let request = GenerateRequest::new("x").with_images(frames());
        assert!(BackendKind::HostedChatV2.completion_request("sys", &request).is_err());
    }

    #[test]
    fn test_data_url_encoding() {
        let image = ImageAttachment::jpeg(ImageKind::Color, ImagePhase::Before, b"ABC".to_vec());
        assert_eq!(image.data_url(), "data:image/jpeg;base64,QUJD");
    }

    #[test]
    fn test_batched_server_requires_single_reply() {
        let provider = ScriptedProvider::new(vec![], &["a", "b"]);
        let backend = ProviderBackend::new(provider, BackendKind::BatchedInferenceServer).unwrap();

        let err = backend.generate(&GenerateRequest::new("x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);

        let seen = backend.provider.seen.lock().unwrap();
        assert_eq!(seen[0].top_p, Some(0.95));
        assert_eq!(seen[0].temperature, Some(0.8));
    }

    #[test]
    fn test_backend_kind_from_config_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: BackendKind,
        }
        let parsed: Wrapper = toml::from_str("kind = \"local-causal-model\"").unwrap();
        assert_eq!(parsed.kind, BackendKind::LocalCausalModel);
    }
}
