//! Anthropic Messages API provider.
//!
//! Streams `/v1/messages` and translates the SSE event sequence
//! (`content_block_start`, `content_block_delta`, `message_delta`,
//! `message_stop`) into [`StreamEvent`]s.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use easel_core::types::{ContentPart, Message, Role, ToolResultContent};

use crate::sse::{EventDecoder, SseEvent, decode_events, parse_sse_response};
use crate::{ChatRequest, EventStream, LlmProvider, StopReason, StreamEvent, ToolDefinition};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    pub base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

/// Tool catalog in Anthropic's `input_schema` shape.
pub fn format_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters_schema,
            })
        })
        .collect()
}

/// Convert history to Anthropic messages.
///
/// Consecutive tool messages are folded into a single `user` message, since
/// the API expects every result for one assistant turn in the next message.
pub fn format_messages(history: &[Message]) -> Vec<serde_json::Value> {
    let mut messages: Vec<serde_json::Value> = Vec::new();
    let mut last_was_tool = false;

    for message in history {
        let blocks: Vec<serde_json::Value> = message.content.iter().map(part_to_json).collect();
        if blocks.is_empty() {
            continue;
        }

        match message.role {
            Role::Tool if last_was_tool => {
                if let Some(content) = messages
                    .last_mut()
                    .and_then(|m| m.get_mut("content"))
                    .and_then(|c| c.as_array_mut())
                {
                    content.extend(blocks);
                }
            }
            Role::Tool | Role::User => {
                messages.push(json!({ "role": "user", "content": blocks }));
            }
            Role::Assistant => {
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
        }
        last_was_tool = message.role == Role::Tool;
    }

    messages
}

fn part_to_json(part: &ContentPart) -> serde_json::Value {
    match part {
        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        ContentPart::Image { image } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.media_type,
                "data": image.to_base64(),
            },
        }),
        ContentPart::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentPart::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let content = match content {
                ToolResultContent::Text(text) => json!(text),
                ToolResultContent::Images(images) => json!(
                    images
                        .iter()
                        .map(|image| json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.media_type,
                                "data": image.to_base64(),
                            },
                        }))
                        .collect::<Vec<_>>()
                ),
            };
            json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            })
        }
    }
}

fn stop_reason(raw: &str) -> StopReason {
    match raw {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

// --- SSE payloads ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockStart {
        index: usize,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockStart {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Tracks block index → tool call id so input fragments can be attributed.
#[derive(Default)]
pub struct AnthropicDecoder {
    tool_blocks: HashMap<usize, String>,
    stop_reason: Option<StopReason>,
    stopped: bool,
}

impl EventDecoder for AnthropicDecoder {
    fn decode(&mut self, event: &SseEvent) -> anyhow::Result<Option<Vec<StreamEvent>>> {
        let parsed: AnthropicEvent = match serde_json::from_str(&event.data) {
            Ok(e) => e,
            Err(e) => {
                trace!(%e, data = %event.data, "Skipping unparseable Anthropic event");
                return Ok(Some(Vec::new()));
            }
        };

        let events = match parsed {
            AnthropicEvent::ContentBlockStart {
                index,
                content_block: ContentBlockStart::ToolUse { id, name },
            } => {
                self.tool_blocks.insert(index, id.clone());
                vec![StreamEvent::ToolCallStarted { id, name }]
            }
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![StreamEvent::TextDelta { text }]
                }
                BlockDelta::InputJsonDelta { partial_json } if !partial_json.is_empty() => {
                    match self.tool_blocks.get(&index) {
                        Some(id) => vec![StreamEvent::ToolCallInputDelta {
                            id: id.clone(),
                            partial: partial_json,
                        }],
                        None => anyhow::bail!("Input fragment for unknown content block {index}"),
                    }
                }
                _ => Vec::new(),
            },
            AnthropicEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = Some(stop_reason(reason));
                }
                Vec::new()
            }
            AnthropicEvent::MessageStop => {
                self.stopped = true;
                vec![StreamEvent::TurnFinished {
                    reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                }]
            }
            AnthropicEvent::Error { error } => {
                anyhow::bail!("Anthropic stream error: {}", error.message)
            }
            AnthropicEvent::ContentBlockStart { .. } | AnthropicEvent::Other => Vec::new(),
        };

        Ok(Some(events))
    }

    fn finish(&mut self) -> anyhow::Result<Vec<StreamEvent>> {
        if self.stopped {
            return Ok(Vec::new());
        }
        anyhow::bail!("Anthropic stream ended before message_stop")
    }
}

#[derive(Debug, serde::Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ChatRequest<'_>) -> anyhow::Result<EventStream> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: request.system,
            messages: format_messages(request.messages),
            stream: true,
            temperature: request.temperature,
            tools: format_tools(request.tools),
        };

        debug!(model = %self.model, base_url = %self.base_url, "Streaming Anthropic Messages API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error {status}: {body}");
        }

        Ok(decode_events(
            parse_sse_response(response),
            AnthropicDecoder::default(),
        ))
    }
}
