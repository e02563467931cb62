//! Directory listing with optional glob filtering.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::path_guard::validate_path;
use crate::{Tool, ToolContext, ToolOutput};

const DEFAULT_LIMIT: usize = 200;

pub struct FileListTool;

#[derive(Deserialize)]
struct Params {
    #[serde(default = "default_path")]
    path: String,
    pattern: Option<String>,
    #[serde(default)]
    recursive: bool,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_path() -> String {
    ".".into()
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn describe(path: &Path, relative: &Path) -> String {
    if path.is_dir() {
        format!("[dir]  {}/", relative.display())
    } else {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        format!("[file] {} ({size} bytes)", relative.display())
    }
}

fn walk(root: &Path, dir: &Path, recursive: bool, limit: usize, out: &mut Vec<String>) -> std::io::Result<bool> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for entry in children {
        if out.len() >= limit {
            return Ok(true);
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        out.push(describe(&path, relative));
        if recursive && path.is_dir() && walk(root, &path, recursive, limit, out)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[async_trait]
impl Tool for FileListTool {
    fn name(&self) -> &str {
        "file_list"
    }

    fn description(&self) -> &str {
        "List files and directories in a workspace path, optionally filtered by glob pattern."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (relative to workspace or absolute). Default: \".\""
                },
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to filter entries (e.g. \"*.png\", \"exports/**/*.png\")"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Whether to recurse into subdirectories. Default: false"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of entries to return. Default: 200"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let params: Params = serde_json::from_value(params)?;

        let dir = match validate_path(&params.path, &context.workspace, context.restrict_to_workspace) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::error(format!("Path error: {e}"))),
        };
        if !dir.is_dir() {
            let reason = if dir.exists() { "Not a directory" } else { "Directory not found" };
            return Ok(ToolOutput::error(format!("{reason}: {}", dir.display())));
        }

        let mut entries = Vec::new();
        let truncated = match &params.pattern {
            Some(pattern) => {
                let full = if params.recursive {
                    format!("{}/**/{pattern}", dir.display())
                } else {
                    format!("{}/{pattern}", dir.display())
                };
                let paths = match glob::glob(&full) {
                    Ok(paths) => paths,
                    Err(e) => return Ok(ToolOutput::error(format!("Invalid glob pattern: {e}"))),
                };
                let mut truncated = false;
                for path in paths.flatten() {
                    if entries.len() >= params.limit {
                        truncated = true;
                        break;
                    }
                    let relative = path.strip_prefix(&dir).unwrap_or(&path);
                    entries.push(describe(&path, relative));
                }
                truncated
            }
            None => match walk(&dir, &dir, params.recursive, params.limit, &mut entries) {
                Ok(t) => t,
                Err(e) => return Ok(ToolOutput::error(format!("Read error: {e}"))),
            },
        };

        if entries.is_empty() {
            let empty = if params.pattern.is_some() {
                "No matching entries found."
            } else {
                "(empty directory)"
            };
            return Ok(ToolOutput::text(empty));
        }
        if truncated {
            entries.push(format!("... (truncated at {} entries)", params.limit));
        }
        Ok(ToolOutput::text(entries.join("\n")))
    }
}
