//! Exact string replacement in workspace files.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::path_guard::validate_path;
use crate::write_file::write_atomic;
use crate::{Tool, ToolContext, ToolOutput};

pub struct EditFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    old_text: String,
    new_text: String,
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact text match with new text. The old_text must appear exactly once in the file."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file (relative to workspace or absolute)"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to find and replace (must match exactly once)"
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let params: Params = serde_json::from_value(params)?;
        if params.old_text.is_empty() {
            return Ok(ToolOutput::error("old_text must not be empty"));
        }

        let path = match validate_path(&params.path, &context.workspace, context.restrict_to_workspace)
        {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Path error: {e}"))),
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ToolOutput::error(format!("File not found: {}", path.display())));
            }
            Err(e) => return Ok(ToolOutput::error(format!("Read error: {e}"))),
        };

        match content.matches(params.old_text.as_str()).count() {
            0 => Ok(ToolOutput::error("No match found for old_text in the file")),
            1 => {
                let updated = content.replacen(&params.old_text, &params.new_text, 1);
                write_atomic(&path, updated.as_bytes()).await?;
                Ok(ToolOutput::text(format!("Edited {}", path.display())))
            }
            n => Ok(ToolOutput::error(format!(
                "old_text matches {n} times; it must match exactly once. \
                 Include more surrounding context."
            ))),
        }
    }
}
