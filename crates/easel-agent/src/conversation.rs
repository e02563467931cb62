//! Append-ordered message history with token accounting and compaction.

use std::collections::HashSet;

use serde::Serialize;

use easel_core::error::{EaselError, Result};
use easel_core::types::{ContentPart, Message, Role, ToolResultContent};

/// Characters per estimated token.
const CHARS_PER_TOKEN: usize = 4;
/// Flat estimate for one image part.
const IMAGE_TOKENS: usize = 1600;
pub const DEFAULT_KEEP_RECENT: usize = 4;
const SUMMARY_HEADER: &str = "[Previous conversation summary]\n";

/// Rough token usage of a conversation, by bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContextEstimate {
    pub user_text_tokens: usize,
    pub assistant_text_tokens: usize,
    pub tool_tokens: usize,
    pub image_count: usize,
    pub message_count: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append `message`. A tool result, in a message of any role, must answer a tool invocation made
    /// by an earlier assistant message that has not been answered yet.
    pub fn append(&mut self, message: Message) -> Result<()> {
        let mut ids = HashSet::new();
        for (id, _, _) in message.tool_uses() {
            if !ids.insert(id) {
                return Err(EaselError::Conversation(format!(
                    "Tool call id '{id}' appears twice in one message"
                )));
            }
        }

        let mut open = self.unanswered_tool_uses();
        for part in &message.content {
            if let ContentPart::ToolResult { tool_use_id, .. } = part {
                if !open.remove(tool_use_id.as_str()) {
                    return Err(EaselError::Conversation(format!(
                        "Tool result '{tool_use_id}' does not answer a pending tool call"
                    )));
                }
            }
        }
        self.messages.push(message);
        Ok(())
    }

    fn unanswered_tool_uses(&self) -> HashSet<&str> {
        let mut open = HashSet::new();
        for message in &self.messages {
            for part in &message.content {
                match part {
                    ContentPart::ToolUse { id, .. } => {
                        open.insert(id.as_str());
                    }
                    ContentPart::ToolResult { tool_use_id, .. } => {
                        open.remove(tool_use_id.as_str());
                    }
                    _ => {}
                }
            }
        }
        open
    }

    /// Drop every message after the first `len`. Rolls back an abandoned turn.
    pub fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Replace everything but the last `keep_recent` messages with one
    /// summary message. Returns how many messages were removed.
    pub fn compact(&mut self, summary: &str, keep_recent: usize) -> usize {
        if self.messages.len() <= keep_recent {
            return 0;
        }
        let split_at = self.messages.len() - keep_recent;
        let tail = self.messages.split_off(split_at);
        let removed = self.messages.len();

        self.messages.clear();
        self.messages
            .push(Message::user_text(format!("{SUMMARY_HEADER}{summary}")));
        self.messages.extend(tail);
        removed
    }

    pub fn estimate_context(&self) -> ContextEstimate {
        let mut user_chars = 0;
        let mut assistant_chars = 0;
        let mut tool_chars = 0;
        let mut user_images = 0;
        let mut assistant_images = 0;
        let mut tool_images = 0;

        for message in &self.messages {
            for part in &message.content {
                match part {
                    ContentPart::Text { text } => match message.role {
                        Role::User => user_chars += text.len(),
                        Role::Assistant => assistant_chars += text.len(),
                        Role::Tool => tool_chars += text.len(),
                    },
                    ContentPart::Image { .. } => match message.role {
                        Role::User => user_images += 1,
                        Role::Assistant => assistant_images += 1,
                        Role::Tool => tool_images += 1,
                    },
                    ContentPart::ToolUse { input, .. } => {
                        tool_chars += input.to_string().len();
                    }
                    ContentPart::ToolResult { content, .. } => match content {
                        ToolResultContent::Text(text) => tool_chars += text.len(),
                        ToolResultContent::Images(images) => tool_images += images.len(),
                    },
                }
            }
        }

        let tokens = |chars: usize, images: usize| chars.div_ceil(CHARS_PER_TOKEN) + images * IMAGE_TOKENS;
        let user_text_tokens = tokens(user_chars, user_images);
        let assistant_text_tokens = tokens(assistant_chars, assistant_images);
        let tool_tokens = tokens(tool_chars, tool_images);

        ContextEstimate {
            user_text_tokens,
            assistant_text_tokens,
            tool_tokens,
            image_count: user_images + assistant_images + tool_images,
            message_count: self.messages.len(),
            total_tokens: user_text_tokens + assistant_text_tokens + tool_tokens,
        }
    }
}
