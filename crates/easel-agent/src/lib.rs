//! Conversation engine: streams the backend, dispatches tool calls, loops.
//!
//! [`Conversation`] owns the append-ordered message history. [`Engine`]
//! runs one turn against it and reports progress as [`AgentEvent`]s for
//! the UI layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod compaction;
pub mod conversation;
pub mod prompt;
pub mod runtime;

pub use conversation::{ContextEstimate, Conversation};
pub use runtime::{Engine, EngineSettings, TurnOutcome};

/// Events emitted by the engine during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Streaming text delta for live output.
    #[serde(rename = "partial_reply")]
    PartialReply { delta: String },

    /// A tool call is about to run.
    #[serde(rename = "tool_call")]
    ToolCall {
        id: String,
        tool: String,
        params: serde_json::Value,
    },

    /// A tool call has completed.
    #[serde(rename = "tool_result")]
    ToolResult {
        id: String,
        tool: String,
        content: String,
        is_error: bool,
    },

    /// Older history was replaced by a summary.
    #[serde(rename = "compacted")]
    Compacted { removed: usize },

    /// Assistant text of the message that ended the turn.
    #[serde(rename = "block_reply")]
    BlockReply { text: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Opening or reading the backend stream failed. Nothing from the
    /// failed step was appended.
    #[error("Backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// The configured cap on backend calls per turn was reached.
    #[error("Turn stopped after {0} backend calls without a final answer")]
    IterationLimit(u32),

    /// The history rejected a message, e.g. a duplicate tool call id.
    #[error(transparent)]
    History(#[from] easel_core::error::EaselError),
}
