//! WebSocket server handler using Axum.

use crate::client::{ClientRegistry, ClientState, SEND_QUEUE_LIMIT};
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::proxy::{self, ProxyState};
use crate::rooms::{normalize_ticker, room_for_ticker};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub proxy: ProxyState,
}

/// Create the gateway router: WebSocket endpoint, health, and the REST proxy.
pub fn create_router(state: Arc<AppState>, cors_origins: &str) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(proxy::routes())
        .with_state(state)
        .layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &str) -> CorsLayer {
    let parsed: Vec<axum::http::HeaderValue> = origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty() && *o != "*")
        .filter_map(|o| o.parse().ok())
        .collect();

    if parsed.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "clients": state.registry.client_count(),
        "subscriptions": state.registry.subscription_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(SEND_QUEUE_LIMIT);
    let client = Arc::new(ClientState::new(tx));
    let client_id = state.registry.register(client.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    // Forward queued frames to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let _ = client.send(&ServerMessage::Connected {
        message: "connected to realtime market data".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    });

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.reset();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg).await {
                            warn!("Error handling message from {client_id}: {e}");
                            let _ = client.send(&ServerMessage::Error {
                                message: e.to_string(),
                                code: "PROCESSING_ERROR".to_string(),
                            });
                            if client.record_violation() {
                                warn!("Client {client_id} exceeded protocol violations, dropping");
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error for {client_id}: {e}");
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if client.send_ping().is_err() {
                    break;
                }
            }
        }
    }

    state.registry.unregister(&client_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);
}

/// Handle a single WebSocket frame.
async fn handle_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(&text)?;
            handle_client_message(state, client, client_msg)
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(state, client, client_msg)
        }
        Message::Ping(_) | Message::Pong(_) => {
            client.update_ping();
            Ok(())
        }
        // Close is observed by the connection loop when the stream ends.
        Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed client message.
fn handle_client_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Subscribe { symbol } => {
            let ticker = normalize_ticker(symbol.ticker())
                .map_err(GatewayError::InvalidSymbol)?;
            state.registry.join_room(&client.id, &room_for_ticker(&ticker))?;
            client.send(&ServerMessage::Subscribed { symbol: ticker })?;
            counter!("gateway_subscriptions_total").increment(1);
            Ok(())
        }
        ClientMessage::Unsubscribe { symbol } => {
            let ticker = normalize_ticker(symbol.ticker())
                .map_err(GatewayError::InvalidSymbol)?;
            state.registry.leave_room(&client.id, &room_for_ticker(&ticker))?;
            client.send(&ServerMessage::Unsubscribed { symbol: ticker })?;
            Ok(())
        }
        ClientMessage::Ping => {
            client.update_ping();
            client.send(&ServerMessage::Pong)?;
            Ok(())
        }
    }
}
