//! Interactive chat loop and event rendering.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use easel_agent::{AgentEvent, Conversation, Engine};

use crate::commands::{self, SlashCommand};

const MAX_RESULT_PREVIEW: usize = 200;

/// Print streamed text as it arrives and one line per tool call.
fn render(event: &AgentEvent) {
    match event {
        AgentEvent::PartialReply { delta } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::ToolCall { tool, params, .. } => {
            eprintln!("\n[{tool}] {params}");
        }
        AgentEvent::ToolResult {
            tool,
            content,
            is_error,
            ..
        } => {
            let status = if *is_error { "failed" } else { "ok" };
            let preview: String = content.chars().take(MAX_RESULT_PREVIEW).collect();
            eprintln!("[{tool} {status}] {preview}");
        }
        AgentEvent::Compacted { removed } => {
            eprintln!("[compacted {removed} earlier messages]");
        }
        AgentEvent::BlockReply { .. } => println!(),
    }
}

/// Run one turn and render its events. Backend errors are printed, not returned.
/// Ctrl-C abandons the turn.
pub async fn send(engine: &Engine, conversation: &mut Conversation, text: &str) {
    send_until(engine, conversation, text, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;
}

/// Run one turn unless `interrupt` completes first. An interrupted turn is
/// rolled back so no tool call is left without its result. Returns whether
/// the turn ran to completion.
async fn send_until(
    engine: &Engine,
    conversation: &mut Conversation,
    text: &str,
    interrupt: impl Future<Output = ()>,
) -> bool {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            render(&event);
        }
    });

    let checkpoint = conversation.len();
    let result = tokio::select! {
        result = engine.submit(conversation, text, &tx) => Some(result),
        _ = interrupt => None,
    };
    drop(tx);
    let _ = printer.await;

    match result {
        Some(Ok(_)) => true,
        Some(Err(e)) => {
            tracing::warn!(%e, "Turn failed");
            println!("\nError: {e}");
            false
        }
        None => {
            conversation.truncate(checkpoint);
            tracing::info!(kept = checkpoint, "Turn interrupted");
            println!("\nInterrupted.");
            false
        }
    }
}

pub async fn run(engine: &Engine, conversation: &mut Conversation) -> anyhow::Result<()> {
    println!("Easel interactive chat. Type /help for commands, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match SlashCommand::parse(line) {
            Some(Ok(command)) => {
                let outcome = commands::execute(command, engine, conversation).await;
                if !outcome.output.is_empty() {
                    println!("{}", outcome.output);
                }
                if outcome.quit {
                    break;
                }
            }
            Some(Err(message)) => println!("{message}"),
            None => send(engine, conversation, line).await,
        }
    }

    Ok(())
}
