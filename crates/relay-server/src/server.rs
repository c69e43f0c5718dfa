use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use relay_core::ids::{SessionId, SessionKey, TenantId};
use relay_core::wire::WireEvent;
use relay_engine::Orchestrator;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9092 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/agent/{tenant_id}/{session_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState { orchestrator };
    let router = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "relay server started");

    let shutdown = CancellationToken::new();
    let shutdown_for_axum = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_for_axum.cancelled().await;
            })
            .await
            .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server: server_task,
    })
}

/// Handle returned by `start()`: keeps the accept loop alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting new connections. In-flight connections finish on
    /// their own.
    pub fn shutdown(&self) {
        info!("server shutdown initiated");
        self.shutdown.cancel();
    }

    /// Wait for the accept loop to exit after `shutdown()`.
    pub async fn drain(self) {
        let _ = self.server.await;
    }
}

/// WebSocket upgrade handler. The session URL carries both identifiers the
/// orchestrator needs.
async fn ws_handler(
    Path((tenant_id, session_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let key = SessionKey::new(TenantId::from_raw(tenant_id), SessionId::from_raw(session_id));
    ws.on_upgrade(move |socket| handle_socket(socket, key, state.orchestrator))
}

/// Bridge one WebSocket connection to the session's event feed: a writer
/// task streams outbound events (plus heartbeat pings), the reader feeds
/// inbound events into the orchestrator.
async fn handle_socket(socket: WebSocket, key: SessionKey, orchestrator: Arc<Orchestrator>) {
    info!(session = %key, "client connected");

    // Reattach: restores from the checkpoint if needed and re-emits any
    // outstanding form request.
    let stream = orchestrator.bus().subscribe(&key);
    if let Err(e) = orchestrator.resume_session(&key).await {
        warn!(session = %key, error = %e, "session reattach failed");
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_key = key.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(event) => {
                            let Ok(json) = serde_json::to_string(&event) else {
                                continue;
                            };
                            if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(session = %writer_key, "writer closed");
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            WsMessage::Text(text) => {
                let event: WireEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(session = %key, error = %e, "unparseable inbound event");
                        continue;
                    }
                };
                if let Err(e) = orchestrator.handle_event(&key, event).await {
                    warn!(session = %key, error = %e, kind = e.kind().as_str(), "inbound event rejected");
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    info!(session = %key, "client disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "healthy"}))
}
