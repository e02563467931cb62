//! LLM-driven compaction: summarize older history, keep the recent tail.

use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use easel_core::types::{ContentPart, Message, Role, ToolResultContent};
use easel_providers::{ChatRequest, LlmProvider, StreamEvent};

use crate::conversation::Conversation;

const SUMMARY_MAX_TOKENS: u32 = 1024;
const RESULT_PREVIEW_CHARS: usize = 500;

/// Ask `provider` for a summary of everything but the last `keep_recent`
/// messages, then compact. Returns the number of messages removed; `0`
/// when the history is short or the summary came back empty.
pub async fn summarize_and_compact(
    conversation: &mut Conversation,
    provider: &dyn LlmProvider,
    keep_recent: usize,
) -> anyhow::Result<usize> {
    let total = conversation.len();
    if total <= keep_recent {
        debug!(total, keep_recent, "Not enough messages to compact");
        return Ok(0);
    }

    let split_at = total - keep_recent;
    let transcript = format_for_summary(&conversation.messages()[..split_at]);
    let prompt = Message::user_text(format!(
        "Summarize the following conversation concisely. Preserve key facts, \
         decisions, file paths, canvas names and tool results needed to \
         continue the conversation.\n\n{transcript}"
    ));

    let messages = [prompt];
    let request = ChatRequest {
        system: "You are a conversation summarizer. Produce a concise summary.",
        messages: &messages,
        tools: &[],
        max_tokens: SUMMARY_MAX_TOKENS,
        temperature: Some(0.3),
    };

    let mut stream = provider.stream(&request).await?;
    let mut summary = String::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::TextDelta { text } = event? {
            summary.push_str(&text);
        }
    }

    let summary = summary.trim();
    if summary.is_empty() {
        warn!("Compaction produced an empty summary, keeping history as-is");
        return Ok(0);
    }

    let before = conversation.estimate_context().total_tokens;
    let removed = conversation.compact(summary, keep_recent);
    info!(
        removed,
        old_tokens = before,
        new_tokens = conversation.estimate_context().total_tokens,
        "Compaction complete"
    );
    Ok(removed)
}

/// Render messages as plain text for the summarizer.
pub fn format_for_summary(messages: &[Message]) -> String {
    let mut lines = Vec::new();

    for message in messages {
        for part in &message.content {
            match (message.role, part) {
                (Role::User, ContentPart::Text { text }) => lines.push(format!("User: {text}")),
                (Role::Assistant, ContentPart::Text { text }) => {
                    lines.push(format!("Assistant: {text}"))
                }
                (_, ContentPart::Text { text }) => lines.push(text.clone()),
                (_, ContentPart::Image { image }) => {
                    lines.push(format!("[{} image]", image.media_type))
                }
                (_, ContentPart::ToolUse { name, input, .. }) => {
                    lines.push(format!("Tool call: {name}({input})"))
                }
                (_, ContentPart::ToolResult { content, is_error, .. }) => {
                    let status = if *is_error { "error" } else { "ok" };
                    let body = match content {
                        ToolResultContent::Text(text) => preview(text),
                        ToolResultContent::Images(images) => format!("{} image(s)", images.len()),
                    };
                    lines.push(format!("Tool result ({status}): {body}"));
                }
            }
        }
    }

    lines.join("\n")
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(RESULT_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
