//! Canvas transport integration tests over real sockets and snapshot files.
//!
//! Run with: `cargo test -p easel-canvas --test transport`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use easel_canvas::{
    CanvasSessionFactory, CanvasTimeouts, FileWorkspaceStore, SessionManager, TransportOptions,
    WorkspaceStore,
};

fn manager(dir: &std::path::Path) -> (SessionManager, Arc<dyn WorkspaceStore>) {
    let store: Arc<dyn WorkspaceStore> = Arc::new(FileWorkspaceStore::new(dir));
    let factory = Arc::new(CanvasSessionFactory {
        options: TransportOptions {
            bind: "127.0.0.1".into(),
            port: 0,
            public_host: None,
        },
        store: store.clone(),
    });
    (
        SessionManager::new(factory, store.clone(), CanvasTimeouts::default()),
        store,
    )
}

async fn wait_connected(sessions: &SessionManager, expected: bool) {
    for _ in 0..100 {
        if sessions.is_connected().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection state never became {expected}");
}

#[tokio::test]
async fn test_snapshot_through_real_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, store) = manager(dir.path());

    let info = sessions.open("demo").await.unwrap();
    assert!(info.address.starts_with("ws://127.0.0.1:"));
    assert!(info.address.ends_with("/canvas"));

    let (ws, _) = connect_async(&info.address).await.expect("WS connect failed");
    let (mut ws_tx, mut ws_rx) = ws.split();
    wait_connected(&sessions, true).await;

    // Sync traffic first, then answer whatever the broker asks.
    ws_tx
        .send(Message::Text(json!({"type": "diff", "n": 1}).to_string().into()))
        .await
        .unwrap();

    let peer = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let Ok(text) = msg.to_text() else { continue };
            let request: serde_json::Value = serde_json::from_str(text).unwrap();
            if request["kind"] == "snapshot-request" {
                let reply = json!({
                    "kind": "snapshot-response",
                    "id": request["id"],
                    "image": "iVBORw0KGgo=",
                });
                ws_tx
                    .send(Message::Text(reply.to_string().into()))
                    .await
                    .unwrap();
            }
        }
    });

    let broker = sessions.broker().await.unwrap();
    let image = broker
        .issue_snapshot(None, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(image.media_type, "image/png");
    assert_eq!(&image.data[1..4], b"PNG");

    sessions.save().await.unwrap();
    let saved = store.load("demo").await.unwrap();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].contains("\"diff\""));

    sessions.close().await;
    assert!(!sessions.is_connected().await);
    peer.abort();
}

#[tokio::test]
async fn test_reopen_replays_saved_sync_log() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, store) = manager(dir.path());
    store
        .save("plan", &[r#"{"type":"put","id":"shape:1"}"#.to_string()])
        .await
        .unwrap();

    let info = sessions.open("plan").await.unwrap();
    let (mut ws, _) = connect_async(&info.address).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no replay received")
        .unwrap()
        .unwrap();
    assert_eq!(first.to_text().unwrap(), r#"{"type":"put","id":"shape:1"}"#);

    sessions.close().await;
}

#[tokio::test]
async fn test_switching_sessions_stops_previous_listener() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, store) = manager(dir.path());

    let first = sessions.open("one").await.unwrap();
    let second = sessions.open("two").await.unwrap();
    assert_ne!(first.address, second.address);

    // The first listener is gone and its canvas was saved on the way out.
    assert!(connect_async(&first.address).await.is_err());
    assert_eq!(store.list().await.unwrap(), vec!["one"]);
    assert_eq!(sessions.list().await.unwrap(), vec!["one"]);

    sessions.close().await;
    assert_eq!(store.list().await.unwrap(), vec!["one", "two"]);
}

#[tokio::test]
async fn test_health_and_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, _store) = manager(dir.path());

    let info = sessions.open("health").await.unwrap();
    let http = info
        .address
        .replace("ws://", "http://")
        .replace("/canvas", "/health");

    let body: serde_json::Value = reqwest::get(&http).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["canvas"], "health");
    assert_eq!(body["connected"], false);

    let (mut ws, _) = connect_async(&info.address).await.unwrap();
    wait_connected(&sessions, true).await;

    ws.close(None).await.unwrap();
    wait_connected(&sessions, false).await;

    sessions.close().await;
}
