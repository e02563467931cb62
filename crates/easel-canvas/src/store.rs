//! Persistence of canvas sync logs, one JSONL file per canvas name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SessionError;

const EXTENSION: &str = "jsonl";

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Saved frames for `name`; empty when nothing was saved yet.
    async fn load(&self, name: &str) -> anyhow::Result<Vec<String>>;

    async fn save(&self, name: &str, frames: &[String]) -> anyhow::Result<()>;

    /// Names with a saved snapshot, sorted.
    async fn list(&self) -> anyhow::Result<Vec<String>>;
}

/// Reject names that would escape the snapshot directory.
pub fn validate_name(name: &str) -> Result<(), SessionError> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '));
    if ok {
        Ok(())
    } else {
        Err(SessionError::InvalidName(name.to_string()))
    }
}

pub struct FileWorkspaceStore {
    dir: PathBuf,
}

impl FileWorkspaceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{EXTENSION}"))
    }
}

#[async_trait]
impl WorkspaceStore for FileWorkspaceStore {
    async fn load(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let path = self.path_for(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut frames = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let frame: String = serde_json::from_str(line).map_err(|e| {
                anyhow::anyhow!("{}:{}: {e}", path.display(), line_no + 1)
            })?;
            frames.push(frame);
        }
        debug!(canvas = name, frames = frames.len(), "Loaded canvas snapshot");
        Ok(frames)
    }

    async fn save(&self, name: &str, frames: &[String]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut content = String::new();
        for frame in frames {
            // Each frame as a JSON string so embedded newlines stay on one line.
            content.push_str(&serde_json::to_string(frame)?);
            content.push('\n');
        }

        let path = self.path_for(name);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(canvas = name, frames = frames.len(), path = %path.display(), "Saved canvas snapshot");
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
