//! File reading tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::path_guard::validate_path;
use crate::{Tool, ToolContext, ToolOutput};

pub struct ReadFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace, optionally a window of lines. Returns content with line numbers."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file (relative to workspace or absolute)"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start from (0-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let params: Params = serde_json::from_value(params)?;

        let path = match validate_path(&params.path, &context.workspace, context.restrict_to_workspace)
        {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Path error: {e}"))),
        };

        if !path.is_file() {
            let reason = if path.exists() { "Not a file" } else { "File not found" };
            return Ok(ToolOutput::error(format!("{reason}: {}", path.display())));
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return Ok(ToolOutput::error(format!("Read error: {e}"))),
        };

        let numbered: Vec<String> = content
            .lines()
            .enumerate()
            .skip(params.offset)
            .take(params.limit.unwrap_or(usize::MAX))
            .map(|(i, line)| format!("{:>6}\t{line}", i + 1))
            .collect();

        if numbered.is_empty() {
            return Ok(ToolOutput::text("(empty file or offset beyond end)"));
        }
        Ok(ToolOutput::text(numbered.join("\n")))
    }
}
