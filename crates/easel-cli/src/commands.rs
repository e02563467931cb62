//! REPL slash commands.

use std::sync::Arc;

use serde_json::json;

use easel_agent::{Conversation, Engine};
use easel_canvas::SessionManager;

pub const HELP: &str = "\
Commands:
  /open NAME     open (or switch to) the canvas NAME
  /close         save and close the open canvas
  /save          save the open canvas
  /export        export every page into the workspace
  /canvases      list saved canvases
  /status        canvas and model status
  /clear         forget the conversation
  /compact [N]   summarize all but the last N messages
  /context       estimated context usage
  /help          this text
  /quit          leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Open(String),
    Close,
    Save,
    Export,
    Canvases,
    Status,
    Clear,
    Compact(Option<usize>),
    Context,
    Help,
    Quit,
}

impl SlashCommand {
    /// `None` when `line` is not a command; `Some(Err)` when it is malformed.
    pub fn parse(line: &str) -> Option<Result<Self, String>> {
        let rest = line.trim().strip_prefix('/')?;
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        let command = match (name, arg) {
            ("open", "") => Err("Usage: /open NAME".to_string()),
            ("open", name) => Ok(Self::Open(name.to_string())),
            ("close", _) => Ok(Self::Close),
            ("save", _) => Ok(Self::Save),
            ("export", _) => Ok(Self::Export),
            ("canvases" | "list", _) => Ok(Self::Canvases),
            ("status", _) => Ok(Self::Status),
            ("clear" | "new", _) => Ok(Self::Clear),
            ("compact", "") => Ok(Self::Compact(None)),
            ("compact", n) => n
                .parse()
                .map(|n| Self::Compact(Some(n)))
                .map_err(|_| format!("Not a message count: {n}")),
            ("context", _) => Ok(Self::Context),
            ("help" | "?", _) => Ok(Self::Help),
            ("quit" | "exit", _) => Ok(Self::Quit),
            (other, _) => Err(format!("Unknown command: /{other}. Try /help")),
        };
        Some(command)
    }
}

/// Text to show, and whether to leave the REPL.
pub struct CommandOutcome {
    pub output: String,
    pub quit: bool,
}

impl CommandOutcome {
    fn say(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            quit: false,
        }
    }
}

fn sessions(engine: &Engine) -> &Arc<SessionManager> {
    &engine.context().sessions
}

/// Run `command`. Failures come back as text; nothing here ends the process.
pub async fn execute(
    command: SlashCommand,
    engine: &Engine,
    conversation: &mut Conversation,
) -> CommandOutcome {
    match command {
        SlashCommand::Open(name) => match sessions(engine).open(&name).await {
            Ok(info) => CommandOutcome::say(format!(
                "Canvas '{}' is open. Connect the device to {}",
                info.name, info.address
            )),
            Err(e) => CommandOutcome::say(format!("Could not open '{name}': {e}")),
        },
        SlashCommand::Close => match sessions(engine).active_info().await {
            Some(info) => {
                sessions(engine).close().await;
                CommandOutcome::say(format!("Canvas '{}' closed.", info.name))
            }
            None => CommandOutcome::say("No canvas is open."),
        },
        SlashCommand::Save => match sessions(engine).save().await {
            Ok(()) => CommandOutcome::say("Saved."),
            Err(e) => CommandOutcome::say(format!("Save failed: {e}")),
        },
        SlashCommand::Export => {
            let output = engine
                .tools()
                .invoke("canvas_export", json!({}), engine.context())
                .await;
            CommandOutcome::say(output.text_content())
        }
        SlashCommand::Canvases => match sessions(engine).list().await {
            Ok(names) if names.is_empty() => CommandOutcome::say("No saved canvases."),
            Ok(names) => CommandOutcome::say(names.join("\n")),
            Err(e) => CommandOutcome::say(format!("Listing canvases failed: {e}")),
        },
        SlashCommand::Status => {
            let canvas = match sessions(engine).active_info().await {
                Some(info) => {
                    let link = if sessions(engine).is_connected().await {
                        "connected"
                    } else {
                        "waiting for device"
                    };
                    format!("{} at {} ({link})", info.name, info.address)
                }
                None => "none".to_string(),
            };
            let provider = engine.provider();
            CommandOutcome::say(format!(
                "Model: {} via {}\nCanvas: {canvas}\nMessages: {}",
                provider.model(),
                provider.id(),
                conversation.len()
            ))
        }
        SlashCommand::Clear => {
            conversation.clear();
            CommandOutcome::say("Conversation cleared.")
        }
        SlashCommand::Compact(keep) => {
            let keep = keep.unwrap_or(engine.settings().keep_recent);
            match engine.compact(conversation, keep).await {
                Ok(0) => CommandOutcome::say("Nothing to compact."),
                Ok(removed) => CommandOutcome::say(format!(
                    "Summarized {removed} messages; {} remain.",
                    conversation.len()
                )),
                Err(e) => CommandOutcome::say(format!("Compaction failed: {e}")),
            }
        }
        SlashCommand::Context => {
            let e = conversation.estimate_context();
            CommandOutcome::say(format!(
                "~{} tokens in {} messages\n  user:      {}\n  assistant: {}\n  tools:     {}\n  images:    {}",
                e.total_tokens,
                e.message_count,
                e.user_text_tokens,
                e.assistant_text_tokens,
                e.tool_tokens,
                e.image_count
            ))
        }
        SlashCommand::Help => CommandOutcome::say(HELP),
        SlashCommand::Quit => CommandOutcome {
            output: String::new(),
            quit: true,
        },
    }
}
