//! Turn loop: stream the backend, assemble one assistant message, run its
//! tool calls in order, repeat until the backend stops calling tools.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use easel_core::config::Config;
use easel_core::types::{ContentPart, Message};
use easel_providers::{ChatRequest, LlmProvider, StopReason, StreamEvent, ToolDefinition};
use easel_tools::{ToolContext, ToolRegistry};

use crate::compaction::summarize_and_compact;
use crate::conversation::{Conversation, DEFAULT_KEEP_RECENT};
use crate::prompt::{CanvasState, build_system_prompt};
use crate::{AgentEvent, EngineError};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Cap on backend calls per turn; `None` runs until the backend stops
    /// calling tools.
    pub max_iterations: Option<u32>,
    pub system_prompt: Option<String>,
    pub auto_compact: bool,
    pub max_context_tokens: usize,
    pub keep_recent: usize,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            max_iterations: config.max_turn_iterations(),
            system_prompt: config.custom_system_prompt().map(str::to_string),
            auto_compact: config.auto_compact(),
            max_context_tokens: config.max_context_tokens(),
            keep_recent: config.compact_keep_recent(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: None,
            max_iterations: None,
            system_prompt: None,
            auto_compact: false,
            max_context_tokens: 100_000,
            keep_recent: DEFAULT_KEEP_RECENT,
        }
    }
}

/// What a completed turn produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Text of the final assistant message.
    pub text: String,
    pub backend_calls: u32,
    pub tool_calls: u32,
}

/// Folds a backend event stream into one assistant message.
///
/// Consecutive text fragments become one text part. Tool-call input
/// fragments are concatenated per call id and parsed when the message is
/// finished. Parts keep the order in which they started.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    parts: Vec<Pending>,
    stop_reason: Option<StopReason>,
}

#[derive(Debug)]
enum Pending {
    Text(String),
    Call { id: String, name: String, input: String },
}

impl MessageAssembler {
    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta { text } => {
                if let Some(Pending::Text(current)) = self.parts.last_mut() {
                    current.push_str(&text);
                } else {
                    self.parts.push(Pending::Text(text));
                }
            }
            StreamEvent::ToolCallStarted { id, name } => {
                self.parts.push(Pending::Call {
                    id,
                    name,
                    input: String::new(),
                });
            }
            StreamEvent::ToolCallInputDelta { id, partial } => {
                let call = self.parts.iter_mut().rev().find_map(|p| match p {
                    Pending::Call { id: call_id, input, .. } if *call_id == id => Some(input),
                    _ => None,
                });
                match call {
                    Some(input) => input.push_str(&partial),
                    None => warn!(call_id = %id, "Input fragment for unknown tool call dropped"),
                }
            }
            StreamEvent::TurnFinished { reason } => self.stop_reason = Some(reason),
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn finish(self) -> Message {
        let content = self
            .parts
            .into_iter()
            .filter_map(|part| match part {
                Pending::Text(text) if text.is_empty() => None,
                Pending::Text(text) => Some(ContentPart::Text { text }),
                Pending::Call { id, name, input } => {
                    let input = if input.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&input).unwrap_or_else(|e| {
                            warn!(tool = %name, %e, "Tool input is not valid JSON; using {{}}");
                            json!({})
                        })
                    };
                    Some(ContentPart::ToolUse { id, name, input })
                }
            })
            .collect();
        Message::assistant(content)
    }
}

pub struct Engine {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    context: ToolContext,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        context: ToolContext,
        settings: EngineSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            context,
            settings,
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Append `text` as a user message and run a turn.
    pub async fn submit(
        &self,
        conversation: &mut Conversation,
        text: &str,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<TurnOutcome, EngineError> {
        conversation.append(Message::user_text(text))?;

        if self.settings.auto_compact {
            self.auto_compact(conversation, events).await;
        }

        self.run_turn(conversation, events).await
    }

    async fn auto_compact(
        &self,
        conversation: &mut Conversation,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) {
        let estimate = conversation.estimate_context();
        if estimate.total_tokens <= self.settings.max_context_tokens {
            return;
        }
        info!(
            tokens = estimate.total_tokens,
            limit = self.settings.max_context_tokens,
            "Context over limit, compacting"
        );
        match summarize_and_compact(conversation, self.provider.as_ref(), self.settings.keep_recent)
            .await
        {
            Ok(0) => {}
            Ok(removed) => {
                let _ = events.send(AgentEvent::Compacted { removed });
            }
            Err(e) => warn!(%e, "Auto-compaction failed, continuing anyway"),
        }
    }

    /// Run the turn loop over the current history.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<TurnOutcome, EngineError> {
        let start = Instant::now();
        let definitions = self.tools.definitions();
        let system = self.system_prompt().await;
        let mut backend_calls: u32 = 0;
        let mut tool_calls: u32 = 0;

        loop {
            if let Some(limit) = self.settings.max_iterations {
                if backend_calls >= limit {
                    warn!(limit, "Turn iteration limit reached");
                    return Err(EngineError::IterationLimit(limit));
                }
            }

            backend_calls += 1;
            debug!(iteration = backend_calls, messages = conversation.len(), "Streaming");
            let (message, stop_reason) = self
                .stream_step(conversation, &system, &definitions, events)
                .await?;

            let calls: Vec<(String, String, serde_json::Value)> = message
                .tool_uses()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            let text = message.text();
            conversation.append(message)?;

            if calls.is_empty() {
                if stop_reason == Some(StopReason::MaxTokens) {
                    warn!("Backend stopped at the token limit");
                }
                let _ = events.send(AgentEvent::BlockReply { text: text.clone() });
                info!(
                    backend_calls,
                    tool_calls,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Turn complete"
                );
                return Ok(TurnOutcome {
                    text,
                    backend_calls,
                    tool_calls,
                });
            }

            for (id, name, input) in calls {
                tool_calls += 1;
                let _ = events.send(AgentEvent::ToolCall {
                    id: id.clone(),
                    tool: name.clone(),
                    params: input.clone(),
                });

                let output = self.tools.invoke(&name, input, &self.context).await;

                let _ = events.send(AgentEvent::ToolResult {
                    id: id.clone(),
                    tool: name,
                    content: output.text_content(),
                    is_error: output.is_error,
                });
                let is_error = output.is_error;
                conversation.append(Message::tool_result(id, output.into_result_content(), is_error))?;
            }
        }
    }

    async fn stream_step(
        &self,
        conversation: &Conversation,
        system: &str,
        definitions: &[ToolDefinition],
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<(Message, Option<StopReason>), EngineError> {
        let request = ChatRequest {
            system,
            messages: conversation.messages(),
            tools: definitions,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let mut stream = self
            .provider
            .stream(&request)
            .await
            .map_err(EngineError::Backend)?;

        let mut assembler = MessageAssembler::default();
        while let Some(event) = stream.next().await {
            let event = event.map_err(EngineError::Backend)?;
            if let StreamEvent::TextDelta { text } = &event {
                let _ = events.send(AgentEvent::PartialReply { delta: text.clone() });
            }
            assembler.push(event);
        }

        let stop_reason = assembler.stop_reason();
        debug!(?stop_reason, "Backend stream ended");
        Ok((assembler.finish(), stop_reason))
    }

    async fn system_prompt(&self) -> String {
        let active = self.context.sessions.active_info().await;
        let canvas = CanvasState {
            active: active.as_ref(),
            connected: self.context.sessions.is_connected().await,
        };
        build_system_prompt(
            self.settings.system_prompt.as_deref(),
            &self.tools,
            &self.context.workspace,
            &canvas,
        )
    }

    /// Summarize all but the last `keep_recent` messages through the backend.
    pub async fn compact(
        &self,
        conversation: &mut Conversation,
        keep_recent: usize,
    ) -> anyhow::Result<usize> {
        summarize_and_compact(conversation, self.provider.as_ref(), keep_recent).await
    }
}
