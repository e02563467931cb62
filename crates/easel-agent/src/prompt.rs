//! System prompt builder.

use std::path::Path;

use easel_canvas::SessionInfo;
use easel_tools::ToolRegistry;

const DEFAULT_IDENTITY: &str = "You are Easel, an assistant that sketches and edits drawings on a \
     shared canvas and works with files in the user's workspace.";

/// Canvas state as the prompt describes it.
pub struct CanvasState<'a> {
    pub active: Option<&'a SessionInfo>,
    pub connected: bool,
}

pub fn build_system_prompt(
    custom_system_prompt: Option<&str>,
    tools: &ToolRegistry,
    workspace: &Path,
    canvas: &CanvasState<'_>,
) -> String {
    let mut parts = Vec::new();

    parts.push(custom_system_prompt.unwrap_or(DEFAULT_IDENTITY).to_string());

    let now = chrono::Utc::now();
    parts.push(format!("Current time: {}", now.format("%Y-%m-%d %H:%M:%S UTC")));
    parts.push(format!("Workspace directory: {}", workspace.display()));

    let tool_names = tools.list();
    if !tool_names.is_empty() {
        parts.push(format!("Available tools: {}", tool_names.join(", ")));
    }

    let canvas_line = match canvas.active {
        Some(info) if canvas.connected => {
            format!("Canvas: '{}' is open and the device is connected.", info.name)
        }
        Some(info) => format!(
            "Canvas: '{}' is open but no device is connected yet; it should connect to {}.",
            info.name, info.address
        ),
        None => "Canvas: none open. Canvas tools will fail until the user opens one.".to_string(),
    };
    parts.push(canvas_line);

    // Project-specific guidance.
    let guide = workspace.join("EASEL.md");
    if let Ok(content) = std::fs::read_to_string(&guide) {
        parts.push(format!("--- Workspace Instructions ---\n{content}"));
    }

    parts.join("\n\n")
}
