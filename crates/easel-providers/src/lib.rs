//! LLM backend abstraction.
//!
//! Every vendor is adapted to one shape: [`LlmProvider::stream`] takes the
//! conversation history, the tool catalog and a system prompt, and yields an
//! ordered sequence of [`StreamEvent`]s. The conversation engine depends only
//! on this trait.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use easel_core::config::Config;
use easel_core::types::Message;

pub mod anthropic;
pub mod failover;
pub mod openai;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use failover::FailoverProvider;
pub use openai::OpenAiProvider;

/// Why the backend ended its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// One unit of streamed backend output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolCallStarted { id: String, name: String },
    ToolCallInputDelta { id: String, partial: String },
    TurnFinished { reason: StopReason },
}

/// Tool catalog entry as advertised to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A single backend call.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// The core backend trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "anthropic", "openai").
    fn id(&self) -> &str;

    /// Model this provider requests.
    fn model(&self) -> &str;

    /// Open a streamed chat completion.
    async fn stream(&self, request: &ChatRequest<'_>) -> anyhow::Result<EventStream>;
}

/// Build the backend described by `config.models.providers`.
///
/// The first provider uses the agent-level model override; several providers
/// are chained into a [`FailoverProvider`] in the configured order.
pub fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();

    for (i, pc) in config.providers().iter().enumerate() {
        let model = if i == 0 {
            config.default_model()
        } else {
            pc.default_model.clone().unwrap_or_default()
        };
        let api_key = pc.resolve_api_key().unwrap_or_default();
        let base_url = pc.base_url.as_deref();

        let provider: Arc<dyn LlmProvider> = match pc.id.as_str() {
            "anthropic" => Arc::new(AnthropicProvider::new(api_key, model, base_url)),
            "openai" => Arc::new(OpenAiProvider::openai(api_key, model, base_url)),
            "openrouter" => Arc::new(OpenAiProvider::openrouter(api_key, model, base_url)),
            "ollama" => Arc::new(OpenAiProvider::ollama(model, base_url)),
            other => anyhow::bail!("Unknown provider '{other}'"),
        };
        providers.push(provider);
    }

    match providers.len() {
        0 => anyhow::bail!("No LLM provider configured; add one under models.providers"),
        1 => Ok(providers.remove(0)),
        _ => Ok(Arc::new(FailoverProvider::new("failover".into(), providers))),
    }
}
