//! # lmprog engine
//!
//! Language-model backed program synthesis and execution.
//!
//! ## Core Concepts
//! - **Program units**: a prompt template bound to shared scopes; one query in,
//!   executed Rhai code out
//! - **Function synthesis**: calls to undefined functions become new
//!   definitions, recursively
//! - **Scopes**: a read-only fixed tier of host capabilities and a shared
//!   variable tier populated at runtime
//! - **Sandbox**: runs scripts against a scope snapshot with import, eval and
//!   double-underscore guards
//! - **Provider**: trait-based LLM communication (OpenAI, Anthropic, local,
//!   batched server)

pub mod error;
pub mod provider;
pub mod backend;
pub mod prompt;
pub mod extract;
pub mod callgraph;
pub mod scope;
pub mod sandbox;
pub mod transcript;
pub mod synth;
pub mod unit;
pub mod config;

pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use provider::{
    LlmProvider, ProviderConfig, ProviderType, ProviderError,
    ChatMessage, Role, CompletionRequest, CompletionResponse,
    FinishReason, Usage, UsageTracker,
    OpenAIProvider, AnthropicProvider, ServerProvider,
};
pub use backend::{
    BackendKind, GenerateRequest, GenerationOptions, ImageAttachment, ImageKind, ImagePhase,
    InferenceBackend, ProviderBackend, RetryPolicy,
};
pub use prompt::PromptTemplate;
pub use extract::extract;
pub use callgraph::{extract_calls, CallGraph};
pub use scope::{Batch, Binding, FixedScope, HostFn, Namespace, ScriptFn, SharedScope, VariableScope};
pub use sandbox::{Execution, Sandbox};
pub use transcript::{SharedTranscript, Transcript};
pub use synth::FunctionSynthesizer;
pub use unit::{ProgramUnit, UnitBehavior, UnitOutput, WHOLE_ANSWER};
pub use config::{BackendSettings, EngineConfig, UnitConfig};
