//! Tools exposed to the LLM during a turn.
//!
//! Each tool implements the [`Tool`] trait. The [`ToolRegistry`] is the only
//! surface the conversation engine sees: [`ToolRegistry::invoke`] always
//! yields a [`ToolOutput`], turning errors and panics into error-flagged
//! results so every tool call gets an answer in the transcript.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{info, warn};

use easel_canvas::SessionManager;
use easel_core::types::{ImageData, ToolResultContent};
use easel_providers::ToolDefinition;

pub mod canvas;
pub mod edit_file;
pub mod file_list;
pub mod path_guard;
pub mod read_file;
pub mod write_file;

/// Context provided to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    pub restrict_to_workspace: bool,
    /// Source of the active canvas broker for canvas tools.
    pub sessions: Arc<SessionManager>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text(String),
    Image(ImageData),
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text(text.into())],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text(message.into())],
            is_error: true,
        }
    }

    pub fn images(images: Vec<ImageData>) -> Self {
        Self {
            content: images.into_iter().map(ToolContent::Image).collect(),
            is_error: false,
        }
    }

    /// Text parts joined by newlines.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text(t) => Some(t.as_str()),
                ToolContent::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Payload for a tool-result message. Pure image output stays images;
    /// mixed output is flattened to text.
    pub fn into_result_content(self) -> ToolResultContent {
        let all_images =
            !self.content.is_empty() && self.content.iter().all(|c| matches!(c, ToolContent::Image(_)));
        if all_images {
            let images = self
                .content
                .into_iter()
                .filter_map(|c| match c {
                    ToolContent::Image(image) => Some(image),
                    ToolContent::Text(_) => None,
                })
                .collect();
            return ToolResultContent::Images(images);
        }

        let text = self
            .content
            .iter()
            .map(|c| match c {
                ToolContent::Text(t) => t.clone(),
                ToolContent::Image(image) => format!("[{} image omitted]", image.media_type),
            })
            .collect::<Vec<_>>()
            .join("\n");
        ToolResultContent::Text(text)
    }
}

/// The core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM (e.g., "read_file").
    fn name(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str;

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_tools(&mut registry);
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Catalog entries for the backend request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect()
    }

    /// Run `name` with `input`. Never fails: unknown tools, tool errors and
    /// panics all come back as error-flagged output.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        context: &ToolContext,
    ) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            warn!(tool = %name, "Unknown tool requested");
            return ToolOutput::error(format!("Unknown tool: {name}"));
        };

        let start = Instant::now();
        let result = AssertUnwindSafe(tool.execute(input, context))
            .catch_unwind()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                info!(tool = %name, is_error = output.is_error, duration_ms, "Tool executed");
                output
            }
            Ok(Err(e)) => {
                warn!(tool = %name, %e, duration_ms, "Tool failed");
                ToolOutput::error(format!("Error: {e}"))
            }
            Err(_) => {
                warn!(tool = %name, duration_ms, "Tool panicked");
                ToolOutput::error(format!("Error: tool '{name}' crashed"))
            }
        }
    }
}

pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(Box::new(read_file::ReadFileTool));
    registry.register(Box::new(write_file::WriteFileTool));
    registry.register(Box::new(edit_file::EditFileTool));
    registry.register(Box::new(file_list::FileListTool));
    registry.register(Box::new(canvas::CanvasSnapshotTool));
    registry.register(Box::new(canvas::CanvasExportTool));
    registry.register(Box::new(canvas::CanvasStatusTool));
}
