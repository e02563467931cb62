//! Axum-based WebSocket transport for one canvas session.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::broker::{PeerBroker, PeerConnection};
use crate::relay::SyncRelay;

/// Handle to a running transport. Stopping it closes the listener and any
/// attached peer socket.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address the companion device should connect to.
    fn address(&self) -> &str;

    async fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub bind: String,
    /// `0` picks a free port.
    pub port: u16,
    pub public_host: Option<String>,
}

struct CanvasState {
    canvas: String,
    broker: Arc<PeerBroker>,
    relay: Arc<SyncRelay>,
    shutdown: CancellationToken,
}

pub struct WsTransport {
    address: String,
    local_addr: SocketAddr,
    broker: Arc<PeerBroker>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Bind and start serving `/canvas` and `/health`.
    pub async fn start(
        canvas: &str,
        options: &TransportOptions,
        broker: Arc<PeerBroker>,
        relay: Arc<SyncRelay>,
    ) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();
        let state = Arc::new(CanvasState {
            canvas: canvas.to_string(),
            broker: broker.clone(),
            relay,
            shutdown: shutdown.clone(),
        });

        let app = Router::new()
            .route("/canvas", get(ws_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let bind = format!("{}:{}", options.bind, options.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let local_addr = listener.local_addr()?;

        let host = match &options.public_host {
            Some(host) => host.clone(),
            None => advertised_host(local_addr.ip()),
        };
        let address = format!("ws://{host}:{}/canvas", local_addr.port());
        info!(canvas, %local_addr, %address, "Canvas transport listening");

        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(%e, "Canvas transport stopped with error");
            }
        });

        Ok(Self {
            address,
            local_addr,
            broker,
            shutdown,
            server: Mutex::new(Some(server)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.lock().await.take() {
            let _ = server.await;
        }
        self.broker.attach_peer(None).await;
        info!(address = %self.address, "Canvas transport stopped");
    }
}

/// Host for the advertised address: the LAN address when bound to all
/// interfaces, otherwise the bound address itself.
fn advertised_host(bound: IpAddr) -> String {
    if bound.is_unspecified() {
        lan_ip().map(|ip| ip.to_string()).unwrap_or_else(|| "127.0.0.1".into())
    } else {
        bound.to_string()
    }
}

/// Address of the interface carrying the default route. No packet is sent.
fn lan_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<CanvasState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_peer(state, socket))
}

async fn health_handler(State(state): State<Arc<CanvasState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "canvas": state.canvas,
        "connected": state.broker.is_connected().await,
        "pending": state.broker.pending_count().await,
    }))
}

async fn handle_peer(state: Arc<CanvasState>, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Replay the sync log ahead of anything the broker sends.
    let backlog = state.relay.frames().await;
    let replayed = backlog.len();
    for frame in backlog {
        let _ = tx.send(frame);
    }

    let conn = PeerConnection::new(tx);
    let conn_id = conn.id();
    state.broker.attach_peer(Some(conn)).await;
    info!(canvas = %state.canvas, conn = conn_id, replayed, "Canvas peer connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !state.broker.on_inbound_message(text.as_str()).await {
                        state.relay.record(text.as_str()).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn = conn_id, %e, "Canvas socket error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    state.broker.release_peer(conn_id).await;
    send_task.abort();
    debug!(canvas = %state.canvas, conn = conn_id, "Canvas peer disconnected");
}
