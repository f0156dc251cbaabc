//! Connection handlers for the coplan server.
//!
//! This module handles the WebSocket handshake, the per-connection socket
//! loop and the health endpoint. Everything past the socket is the
//! gateway's job.

use crate::config::Config;
use crate::metrics::{self, Direction, SocketGauge};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use coplan_core::{AuthError, Connection, Gateway};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The connection gateway.
    pub gateway: Arc<Gateway>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config: Config) -> Self {
        Self { gateway, config }
    }
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, gateway: Arc<Gateway>) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let path = config.transport.websocket_path.clone();
    let app = build_app(Arc::new(AppState::new(gateway, config)));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("coplan server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.gateway.connection_count(),
        "rooms": state.gateway.registry().room_count(),
    }))
}

/// Pick the credential from the handshake.
///
/// Lookup order: `Authorization: Bearer` header, `token` query parameter,
/// `token` cookie.
fn extract_credential(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if let Some(token) = bearer.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    if let Some(token) = query.get("token").filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == "token" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let credential = extract_credential(&headers, &query);
    let limit = state.config.limits.max_message_size;

    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move {
            match state.gateway.accept(credential.as_deref()).await {
                Ok((connection, outbound)) => {
                    handle_websocket(socket, state, connection, outbound).await;
                }
                Err(e) => reject(socket, e).await,
            }
        })
}

/// Close an unauthenticated socket with a policy-violation code.
async fn reject(mut socket: WebSocket, reason: AuthError) {
    warn!(reason = %reason, "Rejected connection");
    metrics::record_rejected_handshake(&reason);

    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.to_string().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    connection: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let _gauge = SocketGauge::open();
    let gateway = &state.gateway;

    debug!(connection = %connection.id(), "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Frames queued by the router and the fanout
            Some(text) = outbound.recv() => {
                metrics::record_frame(Direction::Outbound, text.len());
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_frame(Direction::Inbound, text.len());
                        gateway.handle_text(&connection, &text).await;
                        metrics::record_frame_handled(start.elapsed(), gateway.registry().room_count());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_frame(Direction::Inbound, data.len());
                        gateway.handle_bytes(&connection, &data).await;
                        metrics::record_frame_handled(start.elapsed(), gateway.registry().room_count());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection.id(), error = %e, "WebSocket error");
                        metrics::record_socket_error();
                        break;
                    }
                    None => {
                        debug!(connection = %connection.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    gateway.disconnect(&connection).await;
    metrics::set_local_rooms(gateway.registry().room_count());

    debug!(connection = %connection.id(), "WebSocket disconnected");
}
