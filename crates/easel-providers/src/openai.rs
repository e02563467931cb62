//! OpenAI Chat Completions API provider.
//!
//! Implements streaming chat completions via `/v1/chat/completions`.
//! Also serves OpenRouter and Ollama, which speak the same wire format.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use easel_core::types::{ContentPart, ImageData, Message, Role, ToolResultContent};

use crate::sse::{EventDecoder, SseEvent, decode_events, parse_sse_response};
use crate::{ChatRequest, EventStream, LlmProvider, StopReason, StreamEvent, ToolDefinition};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Wire dialect of an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    fn with_style(
        style: ApiStyle,
        id: &str,
        default_base: &str,
        api_key: String,
        model: String,
        base_url: Option<&str>,
    ) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(default_base)
                .trim_end_matches('/')
                .to_string(),
            api_style: style,
            provider_id: id.into(),
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(api_key: String, model: String, base_url: Option<&str>) -> Self {
        Self::with_style(ApiStyle::OpenAi, "openai", OPENAI_BASE_URL, api_key, model, base_url)
    }

    pub fn openrouter(api_key: String, model: String, base_url: Option<&str>) -> Self {
        Self::with_style(
            ApiStyle::OpenRouter,
            "openrouter",
            OPENROUTER_BASE_URL,
            api_key,
            model,
            base_url,
        )
    }

    pub fn ollama(model: String, base_url: Option<&str>) -> Self {
        Self::with_style(
            ApiStyle::Ollama,
            "ollama",
            OLLAMA_BASE_URL,
            String::new(),
            model,
            base_url,
        )
    }
}

pub fn format_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                }
            })
        })
        .collect()
}

fn image_url(image: &ImageData) -> serde_json::Value {
    json!({
        "type": "image_url",
        "image_url": { "url": format!("data:{};base64,{}", image.media_type, image.to_base64()) }
    })
}

/// Convert history to Chat Completions messages.
///
/// Tool messages cannot carry images here, so image results are replaced by
/// a short note and the images follow in one synthetic user message after the
/// run of tool messages.
pub fn format_messages(history: &[Message]) -> Vec<serde_json::Value> {
    let mut messages: Vec<serde_json::Value> = Vec::new();
    let mut pending_images: Vec<serde_json::Value> = Vec::new();

    let flush_images = |messages: &mut Vec<serde_json::Value>, images: &mut Vec<serde_json::Value>| {
        if !images.is_empty() {
            messages.push(json!({ "role": "user", "content": std::mem::take(images) }));
        }
    };

    for message in history {
        if message.role != Role::Tool {
            flush_images(&mut messages, &mut pending_images);
        }

        match message.role {
            Role::User => {
                let has_images = message
                    .content
                    .iter()
                    .any(|p| matches!(p, ContentPart::Image { .. }));

                if has_images {
                    let parts: Vec<serde_json::Value> = message
                        .content
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => {
                                Some(json!({"type": "text", "text": text}))
                            }
                            ContentPart::Image { image } => Some(image_url(image)),
                            _ => None,
                        })
                        .collect();
                    messages.push(json!({"role": "user", "content": parts}));
                } else {
                    let text = message.text();
                    if !text.is_empty() {
                        messages.push(json!({ "role": "user", "content": text }));
                    }
                }
            }
            Role::Assistant => {
                let tool_calls: Vec<serde_json::Value> = message
                    .tool_uses()
                    .map(|(id, name, input)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        })
                    })
                    .collect();

                let text = message.text();
                let mut msg = json!({ "role": "assistant" });
                if !text.is_empty() {
                    msg["content"] = json!(text);
                }
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                if msg.get("content").is_some() || msg.get("tool_calls").is_some() {
                    messages.push(msg);
                }
            }
            Role::Tool => {
                for part in &message.content {
                    let ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = part
                    else {
                        continue;
                    };
                    let text = match content {
                        ToolResultContent::Text(text) => text.clone(),
                        ToolResultContent::Images(images) => {
                            pending_images.extend(images.iter().map(image_url));
                            format!("Attached {} image(s) below.", images.len())
                        }
                    };
                    let text = if *is_error {
                        format!("Error: {text}")
                    } else {
                        text
                    };
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": text,
                    }));
                }
            }
        }
    }
    flush_images(&mut messages, &mut pending_images);

    messages
}

fn stop_reason(raw: &str) -> StopReason {
    match raw {
        "tool_calls" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Maps streamed tool-call indices to ids; the id only arrives on the first
/// delta of each call.
#[derive(Default)]
pub struct OpenAiDecoder {
    tool_calls: HashMap<usize, String>,
    finish: Option<StopReason>,
    done: bool,
}

impl EventDecoder for OpenAiDecoder {
    fn decode(&mut self, event: &SseEvent) -> anyhow::Result<Option<Vec<StreamEvent>>> {
        let data = event.data.trim();

        if data == "[DONE]" {
            self.done = true;
            let reason = self.finish.unwrap_or(StopReason::EndTurn);
            return Ok(Some(vec![StreamEvent::TurnFinished { reason }]));
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(%e, data, "Failed to parse OpenAI chunk");
                return Ok(Some(Vec::new()));
            }
        };

        let mut events = Vec::new();
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(Some(events));
        };

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(StreamEvent::TextDelta { text: content });
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let function = tc.function.unwrap_or_default();
            let id = match self.tool_calls.get(&tc.index) {
                Some(id) => id.clone(),
                None => {
                    let id = tc.id.unwrap_or_else(|| format!("call_{}", tc.index));
                    self.tool_calls.insert(tc.index, id.clone());
                    events.push(StreamEvent::ToolCallStarted {
                        id: id.clone(),
                        name: function.name.clone().unwrap_or_default(),
                    });
                    id
                }
            };
            if let Some(partial) = function.arguments {
                if !partial.is_empty() {
                    events.push(StreamEvent::ToolCallInputDelta { id, partial });
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish = Some(stop_reason(&reason));
        }

        Ok(Some(events))
    }

    fn finish(&mut self) -> anyhow::Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        // Some compatible servers close the stream without [DONE].
        match self.finish {
            Some(reason) => Ok(vec![StreamEvent::TurnFinished { reason }]),
            None => anyhow::bail!("OpenAI stream ended before a finish_reason"),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ChatRequest<'_>) -> anyhow::Result<EventStream> {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        messages.extend(format_messages(request.messages));

        let body = OpenAiRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            tools: format_tools(request.tools),
        };

        debug!(model = %self.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        // Auth differs by style
        if self.api_style != ApiStyle::Ollama {
            req_builder = req_builder.header("authorization", format!("Bearer {}", self.api_key));
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        Ok(decode_events(
            parse_sse_response(response),
            OpenAiDecoder::default(),
        ))
    }
}
