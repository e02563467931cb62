//! File writing tool with atomic writes.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::path_guard::validate_write_path;
use crate::{Tool, ToolContext, ToolOutput};

pub struct WriteFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    content: String,
    #[serde(default)]
    create_dirs: bool,
}

/// Write via a sibling temp file and rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, replacing it if it exists."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file (relative to workspace or absolute)"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                },
                "create_dirs": {
                    "type": "boolean",
                    "description": "Create parent directories if they don't exist (default: false)"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let params: Params = serde_json::from_value(params)?;

        let path = match validate_write_path(
            &params.path,
            &context.workspace,
            context.restrict_to_workspace,
            params.create_dirs,
        ) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Path error: {e}"))),
        };

        if let Err(e) = write_atomic(&path, params.content.as_bytes()).await {
            return Ok(ToolOutput::error(format!("Write error: {e}")));
        }

        Ok(ToolOutput::text(format!(
            "Wrote {} bytes to {}",
            params.content.len(),
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;

    #[tokio::test]
    async fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();

        let result = WriteFileTool
            .execute(
                json!({"path": "out.txt", "content": "hello world"}),
                &context(dir.path()),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.text_content().starts_with("Wrote 11 bytes"));

        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written, "hello world");
        assert!(!dir.path().join("out.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_file_create_dirs() {
        let dir = tempfile::tempdir().unwrap();

        let result = WriteFileTool
            .execute(
                json!({"path": "sub/dir/file.txt", "content": "nested", "create_dirs": true}),
                &context(dir.path()),
            )
            .await
            .unwrap();
        assert!(!result.is_error);

        let written = std::fs::read_to_string(dir.path().join("sub/dir/file.txt")).unwrap();
        assert_eq!(written, "nested");
    }

    #[tokio::test]
    async fn test_write_outside_workspace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = WriteFileTool
            .execute(
                json!({"path": "../escape.txt", "content": "x"}),
                &context(dir.path()),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.text_content().contains("outside"));
    }
}
