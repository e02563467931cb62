//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{EaselError, Result};

/// Top-level Easel configuration, stored as JSON5 in `~/.easel/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas: Option<CanvasConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Replaces the default assistant identity in the system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,

    /// Upper bound on backend round-trips within one turn. Unset means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turn_iterations: Option<u32>,

    #[serde(default = "default_true")]
    pub restrict_to_workspace: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Remote canvas transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(default = "default_canvas_port")]
    pub port: u16,

    /// Host advertised to the companion device instead of the detected LAN address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,

    /// Directory holding one snapshot file per canvas name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,

    #[serde(default = "default_export_timeout")]
    pub export_timeout_secs: u64,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            bind: None,
            port: default_canvas_port(),
            public_host: None,
            dir: None,
            snapshot_timeout_secs: default_snapshot_timeout(),
            export_timeout_secs: default_export_timeout(),
        }
    }
}

fn default_canvas_port() -> u16 {
    18790
}

fn default_snapshot_timeout() -> u64 {
    15
}

fn default_export_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum context tokens before compaction triggers (default: 100,000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,

    /// Automatically compact the conversation when it exceeds the token limit.
    #[serde(default)]
    pub auto_compact: bool,

    /// Number of recent messages kept verbatim by compaction (default: 4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact_keep_recent: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "easel_canvas=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| EaselError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Resolve the workspace directory tools operate in.
    pub fn workspace_dir(&self) -> PathBuf {
        self.agent
            .as_ref()
            .and_then(|a| a.workspace.as_ref())
            .map(|w| expand_path(w))
            .unwrap_or_else(|| data_dir().join("workspace"))
    }

    pub fn restrict_to_workspace(&self) -> bool {
        self.agent
            .as_ref()
            .map(|a| a.restrict_to_workspace)
            .unwrap_or(true)
    }

    /// Model to request: agent override, then first provider default.
    pub fn default_model(&self) -> String {
        self.agent
            .as_ref()
            .and_then(|a| a.model.clone())
            .or_else(|| self.first_provider().and_then(|p| p.default_model.clone()))
            .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_tokens)
            .unwrap_or(4096)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.agent.as_ref().and_then(|a| a.temperature)
    }

    pub fn max_turn_iterations(&self) -> Option<u32> {
        self.agent.as_ref().and_then(|a| a.max_turn_iterations)
    }

    pub fn custom_system_prompt(&self) -> Option<&str> {
        self.agent.as_ref().and_then(|a| a.system_prompt.as_deref())
    }

    pub fn canvas(&self) -> CanvasConfig {
        self.canvas.clone().unwrap_or_default()
    }

    /// Directory for per-canvas snapshot files.
    pub fn canvas_dir(&self) -> PathBuf {
        self.canvas
            .as_ref()
            .and_then(|c| c.dir.as_ref())
            .map(|d| expand_path(d))
            .unwrap_or_else(|| data_dir().join("canvases"))
    }

    pub fn auto_compact(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.auto_compact)
    }

    pub fn max_context_tokens(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.max_context_tokens)
            .unwrap_or(100_000)
    }

    pub fn compact_keep_recent(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.compact_keep_recent)
            .unwrap_or(4)
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_deref())
            .unwrap_or_default()
    }

    pub fn first_provider(&self) -> Option<&ProviderConfig> {
        self.providers().first()
    }

    /// Get a config value by dotted path (e.g. "canvas.port", "agent.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path, creating intermediate objects.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut json = serde_json::to_value(&*self)?;

        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            anyhow::bail!("Empty path");
        };

        let mut current = &mut json;
        for segment in parents {
            let object = current
                .as_object_mut()
                .ok_or_else(|| anyhow::anyhow!("'{segment}' is not inside an object"))?;
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| serde_json::json!({}));
        }

        let object = current
            .as_object_mut()
            .ok_or_else(|| anyhow::anyhow!("Cannot set '{last}' on a non-object value"))?;
        object.insert(last.to_string(), value);

        *self = serde_json::from_value(json)
            .map_err(|e| anyhow::anyhow!("Config deserialization error: {e}"))?;
        Ok(())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.providers().is_empty() {
            warnings.push("No LLM providers configured".to_string());
        }

        for p in self.providers() {
            if p.id != "ollama" && p.resolve_api_key().is_none() {
                warnings.push(format!("Provider '{}' has no API key configured", p.id));
            }
            if !matches!(p.id.as_str(), "anthropic" | "openai" | "openrouter" | "ollama") {
                errors.push(format!("Unknown provider id '{}'", p.id));
            }
        }

        if let Some(canvas) = &self.canvas {
            if canvas.port == 0 {
                errors.push("Canvas port cannot be 0".to_string());
            }
            if canvas.snapshot_timeout_secs == 0 || canvas.export_timeout_secs == 0 {
                errors.push("Canvas timeouts must be positive".to_string());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// Base directory for Easel data: `~/.easel/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".easel")
}
