use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use easel_agent::{Conversation, Engine, EngineSettings};
use easel_canvas::SessionManager;
use easel_core::config::Config;
use easel_tools::{ToolContext, ToolRegistry};

mod commands;
mod logging;
mod repl;

#[derive(Parser)]
#[command(
    name = "easel",
    about = "Terminal assistant that draws on a canvas running on a companion device",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant (one-shot or interactive)
    Chat {
        /// Message to send (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Model to use
        #[arg(long)]
        model: Option<String>,

        /// Canvas to open before the first message
        #[arg(long)]
        canvas: Option<String>,
    },

    /// List saved canvases
    Canvases,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
}

/// Parse a `config set` value: JSON when it parses, a plain string otherwise.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let provider = easel_providers::build_provider(config)?;

    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)?;
    let context = ToolContext {
        workspace,
        restrict_to_workspace: config.restrict_to_workspace(),
        sessions: Arc::new(SessionManager::from_config(config)),
    };

    Ok(Engine::new(
        provider,
        Arc::new(ToolRegistry::with_builtins()),
        context,
        EngineSettings::from_config(config),
    ))
}

async fn chat(
    mut config: Config,
    message: Option<String>,
    model: Option<String>,
    canvas: Option<String>,
) -> anyhow::Result<()> {
    if let Some(model) = model {
        config.set_path("agent.model", serde_json::Value::String(model))?;
    }
    let engine = build_engine(&config)?;
    let sessions = engine.context().sessions.clone();
    tracing::info!(provider = engine.provider().id(), model = engine.provider().model(), "Starting chat");

    if let Some(name) = canvas {
        let info = sessions.open(&name).await?;
        println!("Canvas '{}' is open. Connect the device to {}", info.name, info.address);
    }

    let mut conversation = Conversation::new();
    let result = match message {
        Some(text) => {
            repl::send(&engine, &mut conversation, &text).await;
            Ok(())
        }
        None => repl::run(&engine, &mut conversation).await,
    };

    sessions.close().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    logging::init(config.logging.as_ref(), cli.verbose)?;

    match cli.command {
        Commands::Chat {
            message,
            model,
            canvas,
        } => chat(config, message, model, canvas).await?,
        Commands::Canvases => {
            let names = SessionManager::from_config(&config).list().await?;
            if names.is_empty() {
                println!("No saved canvases in {}", config.canvas_dir().display());
            }
            for name in names {
                println!("{name}");
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Set { key, value } => {
                config.set_path(&key, parse_value(&value))?;
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    eprintln!("Warning: {w}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("Config not saved: {}", errors.join("; "));
                }
                config.save(&config_path)?;
                println!("Set {key} in {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Easel v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Workspace: {}", config.workspace_dir().display());
            println!("Canvases: {}", config.canvas_dir().display());
            println!("Canvas port: {}", config.canvas().port);
            println!("Model: {}", config.default_model());
            let providers: Vec<&str> = config.providers().iter().map(|p| p.id.as_str()).collect();
            println!(
                "Providers: {}",
                if providers.is_empty() { "none".to_string() } else { providers.join(" -> ") }
            );

            let (warnings, errors) = config.validate();
            for w in warnings {
                println!("Warning: {w}");
            }
            for e in errors {
                println!("Error: {e}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_chat_args() {
        let cli = Cli::try_parse_from(["easel", "chat", "-m", "hi", "--canvas", "plans"]).unwrap();
        match cli.command {
            Commands::Chat {
                message, canvas, ..
            } => {
                assert_eq!(message.as_deref(), Some("hi"));
                assert_eq!(canvas.as_deref(), Some("plans"));
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("18791"), serde_json::json!(18791));
        assert_eq!(parse_value("true"), serde_json::json!(true));
        assert_eq!(parse_value("claude-x"), serde_json::json!("claude-x"));
    }
}
