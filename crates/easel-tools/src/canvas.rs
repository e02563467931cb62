//! Tools that look at the live canvas through the active session.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use easel_canvas::store::validate_name;
use easel_core::types::ImageData;

use crate::write_file::write_atomic;
use crate::{Tool, ToolContext, ToolOutput};

const NO_SESSION: &str = "No canvas is open. Ask the user to open one first.";

/// Page selector as sent to the peer. Accepts a string or a number.
fn page_selector(params: &serde_json::Value) -> anyhow::Result<Option<String>> {
    match params.get("page") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => anyhow::bail!("'page' must be a string or number, got {other}"),
    }
}

fn extension(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

pub struct CanvasSnapshotTool;

#[async_trait]
impl Tool for CanvasSnapshotTool {
    fn name(&self) -> &str {
        "canvas_snapshot"
    }

    fn description(&self) -> &str {
        "Capture an image of the canvas as currently drawn on the companion device. Optionally select a page."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "page": {
                    "type": ["string", "integer"],
                    "description": "Page to capture (default: the page currently shown)"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let page = page_selector(&params)?;
        let Some(broker) = context.sessions.broker().await else {
            return Ok(ToolOutput::error(NO_SESSION));
        };

        let timeout = context.sessions.timeouts().snapshot;
        match broker.issue_snapshot(page.as_deref(), timeout).await {
            Ok(image) => Ok(ToolOutput::images(vec![image])),
            Err(e) => Ok(ToolOutput::error(format!("Snapshot failed: {e}"))),
        }
    }
}

pub struct CanvasExportTool;

impl CanvasExportTool {
    async fn write_pages(dir: &Path, pages: &[ImageData]) -> std::io::Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let mut written = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let path = dir.join(format!("page-{:02}.{}", i + 1, extension(&page.media_type)));
            write_atomic(&path, &page.data).await?;
            written.push(path);
        }
        Ok(written)
    }
}

#[async_trait]
impl Tool for CanvasExportTool {
    fn name(&self) -> &str {
        "canvas_export"
    }

    fn description(&self) -> &str {
        "Export every page of the open canvas as images into the workspace exports folder."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "filename": {
                    "type": "string",
                    "description": "Folder name under exports/ (default: the canvas name)"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let Some(active) = context.sessions.active_info().await else {
            return Ok(ToolOutput::error(NO_SESSION));
        };
        let name = params
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or(&active.name)
            .to_string();
        if let Err(e) = validate_name(&name) {
            return Ok(ToolOutput::error(e.to_string()));
        }

        let timeout = context.sessions.timeouts().export;
        let pages = match context.sessions.export_pages(timeout).await {
            Ok(pages) => pages,
            Err(e) => return Ok(ToolOutput::error(format!("Export failed: {e}"))),
        };
        if pages.is_empty() {
            return Ok(ToolOutput::error("The canvas has no pages to export"));
        }

        let dir = context.workspace.join("exports").join(&name);
        let written = match Self::write_pages(&dir, &pages).await {
            Ok(written) => written,
            Err(e) => return Ok(ToolOutput::error(format!("Write error: {e}"))),
        };
        info!(canvas = %active.name, pages = written.len(), dir = %dir.display(), "Canvas exported");

        let listing: Vec<String> = written.iter().map(|p| p.display().to_string()).collect();
        Ok(ToolOutput::text(format!(
            "Exported {} page(s):\n{}",
            written.len(),
            listing.join("\n")
        )))
    }
}

pub struct CanvasStatusTool;

#[async_trait]
impl Tool for CanvasStatusTool {
    fn name(&self) -> &str {
        "canvas_status"
    }

    fn description(&self) -> &str {
        "Report which canvas is open, where the companion device should connect, and whether it is connected."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let status = match context.sessions.active_info().await {
            Some(info) => json!({
                "open": true,
                "canvas": info.name,
                "address": info.address,
                "connected": context.sessions.is_connected().await,
            }),
            None => json!({"open": false, "connected": false}),
        };
        Ok(ToolOutput::text(serde_json::to_string_pretty(&status)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use easel_canvas::{
        CanvasTimeouts, Envelope, PeerBroker, PeerConnection, SaveOperation, Session,
        SessionError, SessionFactory, SessionManager, Transport, WorkspaceStore,
    };
    use tokio::sync::mpsc;

    struct Quiet;

    #[async_trait]
    impl Transport for Quiet {
        fn address(&self) -> &str {
            "ws://test/canvas"
        }
        async fn stop(&self) {}
    }

    #[async_trait]
    impl SaveOperation for Quiet {
        async fn save(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl WorkspaceStore for Quiet {
        async fn load(&self, _name: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn save(&self, _name: &str, _frames: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    /// Sessions whose peer answers snapshots with one page and exports with two.
    struct AnsweringPeer {
        connected: bool,
    }

    #[async_trait]
    impl SessionFactory for AnsweringPeer {
        async fn create(&self, name: &str) -> Result<Session, SessionError> {
            let broker = Arc::new(PeerBroker::new());
            if self.connected {
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                broker.attach_peer(Some(PeerConnection::new(tx))).await;
                let peer = broker.clone();
                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        let reply = match serde_json::from_str::<Envelope>(&frame).unwrap() {
                            Envelope::SnapshotRequest { id, page } => json!({
                                "kind": "snapshot-response",
                                "id": id,
                                "image": if page.as_deref() == Some("3") { "AAM=" } else { "AAE=" },
                            }),
                            Envelope::ExportRequest { id } => json!({
                                "kind": "export-response",
                                "id": id,
                                "pages": ["AAE=", "AAI="],
                            }),
                            other => panic!("unexpected {other:?}"),
                        };
                        peer.on_inbound_message(&reply.to_string()).await;
                    }
                });
            }
            Ok(Session::new(name, broker, Box::new(Quiet), Arc::new(Quiet)))
        }
    }

    async fn context_with_canvas(workspace: &std::path::Path, connected: bool) -> ToolContext {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(AnsweringPeer { connected }),
            Arc::new(Quiet),
            CanvasTimeouts::default(),
        ));
        sessions.open("sketch").await.unwrap();
        ToolContext {
            workspace: workspace.to_path_buf(),
            restrict_to_workspace: true,
            sessions,
        }
    }

    #[tokio::test]
    async fn test_snapshot_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let out = CanvasSnapshotTool
            .execute(json!({}), &crate::test_support::context(dir.path()))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.text_content().contains("No canvas is open"));
    }

    #[tokio::test]
    async fn test_snapshot_returns_image() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_canvas(dir.path(), true).await;

        let out = CanvasSnapshotTool.execute(json!({"page": 3}), &ctx).await.unwrap();
        assert!(!out.is_error);
        assert_eq!(
            out.content,
            vec![crate::ToolContent::Image(ImageData::new("image/png", vec![0, 3]))]
        );
    }

    #[tokio::test]
    async fn test_snapshot_not_connected_is_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_canvas(dir.path(), false).await;

        let out = CanvasSnapshotTool.execute(json!({}), &ctx).await.unwrap();
        assert!(out.is_error);
        assert!(out.text_content().starts_with("Snapshot failed"));
    }

    #[tokio::test]
    async fn test_invalid_page_type_is_err() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_canvas(dir.path(), true).await;
        assert!(CanvasSnapshotTool.execute(json!({"page": [1]}), &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_export_writes_pages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_canvas(dir.path(), true).await;

        let out = CanvasExportTool.execute(json!({}), &ctx).await.unwrap();
        assert!(!out.is_error, "{}", out.text_content());
        assert!(out.text_content().starts_with("Exported 2 page(s)"));

        let exported = dir.path().join("exports/sketch");
        assert_eq!(std::fs::read(exported.join("page-01.png")).unwrap(), vec![0, 1]);
        assert_eq!(std::fs::read(exported.join("page-02.png")).unwrap(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_export_rejects_bad_folder_name() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_canvas(dir.path(), true).await;

        let out = CanvasExportTool
            .execute(json!({"filename": "../up"}), &ctx)
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(!dir.path().join("up").exists());
    }

    #[tokio::test]
    async fn test_status_reports_connection() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_canvas(dir.path(), true).await;

        let out = CanvasStatusTool.execute(json!({}), &ctx).await.unwrap();
        let status: serde_json::Value = serde_json::from_str(&out.text_content()).unwrap();
        assert_eq!(status["canvas"], "sketch");
        assert_eq!(status["connected"], true);

        ctx.sessions.close().await;
        let out = CanvasStatusTool.execute(json!({}), &ctx).await.unwrap();
        let status: serde_json::Value = serde_json::from_str(&out.text_content()).unwrap();
        assert_eq!(status["open"], false);
    }
}
