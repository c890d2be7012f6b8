//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! [backend]
//! kind = "hosted-chat-v2"
//! provider = "openai"
//! model = "gpt-4o"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [units.tabletop_ui]
//! prompt_file = "prompts/tabletop_ui.rhai"
//! query_prefix = "// "
//! query_suffix = "."
//! include_context = true
//! has_return = true
//! return_val_name = "whole_answer"
//! ```

use crate::backend::{BackendKind, GenerationOptions, InferenceBackend, ProviderBackend, RetryPolicy};
use crate::error::{io_error, provider_error, Error, Result};
use crate::prompt::PromptTemplate;
use crate::provider::{AnthropicProvider, LlmProvider, OpenAIProvider, ProviderConfig, ProviderType, ServerProvider};
use crate::sandbox::Sandbox;
use crate::unit::UnitBehavior;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub units: BTreeMap<String, UnitConfig>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| io_error(path, e).with_operation("config::load"))?;
        let mut config: EngineConfig = toml::from_str(&content).map_err(|e| {
            Error::config_invalid(e.to_string())
                .with_operation("config::load")
                .with_context("path", path.display().to_string())
        })?;
        config.prepare(path.parent().unwrap_or(Path::new(".")))?;
        Ok(config)
    }

    /// Load prompt files relative to `base_dir` and check every unit.
    pub fn prepare(&mut self, base_dir: &Path) -> Result<()> {
        for (name, unit) in self.units.iter_mut() {
            unit.load_prompt(base_dir)?;
            unit.validate(name)?;
        }
        Ok(())
    }

    pub fn unit(&self, name: &str) -> Result<&UnitConfig> {
        self.units.get(name).ok_or_else(|| {
            Error::config_invalid(format!("no configuration for unit '{}'", name))
                .with_operation("config::unit")
        })
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub provider: ProviderType,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Overrides the provider's usual key variable
    pub api_key_env: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retry_delay_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            provider: ProviderType::default(),
            model: None,
            base_url: None,
            api_key_env: None,
            timeout_secs: None,
            retry_delay_secs: 10,
        }
    }
}

impl BackendSettings {
    /// Key from the environment; `None` when the provider needs no key.
    fn api_key(&self) -> Result<Option<String>> {
        let Some(name) = self.api_key_env.as_deref().or(self.provider.default_api_key_env()) else {
            return Ok(None);
        };
        std::env::var(name).map(Some).map_err(|_| {
            Error::config_invalid(format!("environment variable {} is not set", name))
                .with_operation("config::api_key")
                .with_context("provider", self.provider.to_string())
        })
    }

    fn provider_config(&self) -> Result<ProviderConfig> {
        let mut config = ProviderConfig::new(self.provider);
        if let Some(key) = self.api_key()? {
            config = config.with_api_key(key);
        }
        if let Some(url) = &self.base_url {
            config = config.with_base_url(url.as_str());
        }
        if let Some(model) = &self.model {
            config = config.with_model(model.as_str());
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(secs);
        }
        Ok(config)
    }

    /// Build a backend, optionally with its own system message.
    pub fn build(&self, system_prompt: Option<&str>) -> Result<Rc<dyn InferenceBackend>> {
        let config = self.provider_config()?;
        debug!(kind = %self.kind, provider = %self.provider, model = %config.model, "building backend");

        match self.provider {
            ProviderType::OpenAI | ProviderType::Local => {
                self.wrap(OpenAIProvider::new(config).map_err(provider_error)?, system_prompt)
            }
            ProviderType::Anthropic => {
                self.wrap(AnthropicProvider::new(config).map_err(provider_error)?, system_prompt)
            }
            ProviderType::Server => self.wrap(ServerProvider::new(config).map_err(provider_error)?, system_prompt),
        }
    }

    /// Settings for one unit: its own backend kind, if it names one.
    pub fn for_unit(&self, unit: &UnitConfig) -> BackendSettings {
        let mut settings = self.clone();
        if let Some(kind) = unit.backend_kind {
            settings.kind = kind;
        }
        settings
    }

    fn wrap<P: LlmProvider + 'static>(
        &self,
        provider: P,
        system_prompt: Option<&str>,
    ) -> Result<Rc<dyn InferenceBackend>> {
        let mut backend = ProviderBackend::new(provider, self.kind)?
            .with_retry(RetryPolicy::new(Duration::from_secs(self.retry_delay_secs)));
        if let Some(system_prompt) = system_prompt {
            backend = backend.with_system_prompt(system_prompt);
        }
        Ok(Rc::new(backend))
    }
}

// ============================================================================
// Units
// ============================================================================

/// Options of one program unit (or of the function synthesizer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    pub prompt_text: String,
    pub prompt_file: Option<PathBuf>,
    pub stop: Vec<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub query_prefix: String,
    pub query_suffix: String,
    pub maintain_session: bool,
    pub debug_mode: bool,
    pub include_context: bool,
    pub has_return: bool,
    pub return_val_name: String,
    pub system_prompt: Option<String>,
    /// Oracle family for this unit only
    pub backend_kind: Option<BackendKind>,
    pub max_operations: Option<u64>,
    pub max_call_levels: Option<usize>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            prompt_text: String::new(),
            prompt_file: None,
            stop: Vec::new(),
            temperature: 0.0,
            max_tokens: 512,
            query_prefix: String::new(),
            query_suffix: String::new(),
            maintain_session: false,
            debug_mode: false,
            include_context: false,
            has_return: false,
            return_val_name: String::new(),
            system_prompt: None,
            backend_kind: None,
            max_operations: None,
            max_call_levels: None,
        }
    }
}

impl UnitConfig {
    fn load_prompt(&mut self, base_dir: &Path) -> Result<()> {
        if let Some(file) = &self.prompt_file {
            let path = if file.is_absolute() { file.clone() } else { base_dir.join(file) };
            self.prompt_text =
                std::fs::read_to_string(&path).map_err(|e| io_error(&path, e).with_operation("config::load_prompt"))?;
        }
        Ok(())
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.has_return && self.return_val_name.is_empty() {
            return Err(Error::config_invalid("has_return is set without return_val_name")
                .with_operation("config::validate")
                .with_context("unit", name));
        }
        Ok(())
    }

    pub fn template(&self) -> PromptTemplate {
        PromptTemplate::new(self.prompt_text.clone())
            .with_query_decoration(self.query_prefix.clone(), self.query_suffix.clone())
            .with_session(self.maintain_session)
    }

    pub fn options(&self) -> GenerationOptions {
        GenerationOptions {
            stop: self.stop.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn behavior(&self) -> UnitBehavior {
        UnitBehavior {
            debug_mode: self.debug_mode,
            include_context: self.include_context,
            return_val_name: self.has_return.then(|| self.return_val_name.clone()),
        }
    }

    pub fn sandbox(&self) -> Sandbox {
        let mut sandbox = Sandbox::new();
        if let Some(max) = self.max_operations {
            sandbox = sandbox.with_max_operations(max);
        }
        if let Some(max) = self.max_call_levels {
            sandbox = sandbox.with_max_call_levels(max);
        }
        sandbox
    }
}
