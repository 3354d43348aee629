//! HTTP and WebSocket control surface for the daemon.
//!
//! A thin layer over the engine's public operations: JSON endpoints
//! under `/api` and a `/ws` channel pushing every engine update.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::engine::{ChargeEngine, ConfigUpdate};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChargeEngine>,
    /// Signals the daemon to shut down (used by `/api/shutdown`).
    pub shutdown: mpsc::Sender<()>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/scan", post(post_scan))
        .route("/api/disconnect", post(post_disconnect))
        .route("/api/override", post(post_override))
        .route("/api/poll", post(post_poll))
        .route("/api/chart", get(get_chart))
        .route("/api/shutdown", post(post_shutdown))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.engine.charge_config();
    Json(json!({
        "charge_max": config.charge_max,
        "charge_min": config.charge_min,
        "pd_mode": config.pd_mode.as_int(),
        "telemetry_interval": config.telemetry_interval,
    }))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    match state.engine.update_config(update) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn post_scan(State(state): State<AppState>) -> impl IntoResponse {
    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.start().await {
            warn!("Start failed: {e}");
        }
    });
    Json(json!({"ok": true, "message": "Scan started"}))
}

async fn post_disconnect(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.stop().await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct OverrideRequest {
    mode: Option<String>,
}

async fn post_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> impl IntoResponse {
    let mode = request.mode.as_deref().unwrap_or("");
    match state.engine.set_override(mode).await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn post_poll(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.poll_telemetry().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"ok": true, "data": state.engine.status()})),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn get_chart(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.chart_history())
}

async fn post_shutdown(State(state): State<AppState>) -> impl IntoResponse {
    info!("Shutdown requested via API");
    let _ = state.shutdown.try_send(());
    Json(json!({"ok": true}))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Push every engine update to the client and service its requests.
/// A client that falls behind skips to the newest snapshot.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");
    let mut updates = state.engine.subscribe();

    let initial = json!({"type": "status_update", "data": state.engine.status()});
    if socket.send(Message::Text(initial.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(status) => {
                    let payload = json!({"type": "status_update", "data": status});
                    if socket.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_ws_message(&state, &text).await {
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {e}");
                    break;
                }
            },
        }
    }
    info!("WebSocket client disconnected");
}

fn ws_error(message: impl Into<String>) -> Value {
    json!({"type": "error", "message": message.into()})
}

async fn handle_ws_message(state: &AppState, raw: &str) -> Option<Value> {
    let engine = &state.engine;
    let data: Value = match serde_json::from_str(raw) {
        Ok(data) => data,
        Err(_) => return Some(ws_error("Invalid JSON")),
    };

    let status_update = |engine: &Arc<ChargeEngine>| {
        json!({"type": "status_update", "data": engine.status()})
    };

    match data.get("type").and_then(Value::as_str) {
        Some("set_max") => {
            let value = match ws_percent_value(&data) {
                Ok(value) => value,
                Err(reply) => return Some(reply),
            };
            let update = ConfigUpdate {
                charge_max: value,
                ..Default::default()
            };
            match engine.update_config(update) {
                Ok(()) => Some(status_update(engine)),
                Err(e) => Some(ws_error(e.to_string())),
            }
        }
        Some("set_min") => {
            let value = match ws_percent_value(&data) {
                Ok(value) => value,
                Err(reply) => return Some(reply),
            };
            let update = ConfigUpdate {
                charge_min: value,
                ..Default::default()
            };
            match engine.update_config(update) {
                Ok(()) => Some(status_update(engine)),
                Err(e) => Some(ws_error(e.to_string())),
            }
        }
        Some("scan") => {
            let engine_task = Arc::clone(engine);
            tokio::spawn(async move {
                if let Err(e) = engine_task.start().await {
                    warn!("Start failed: {e}");
                }
            });
            Some(status_update(engine))
        }
        Some("disconnect") => {
            if let Err(e) = engine.stop().await {
                warn!("Stop failed: {e}");
            }
            Some(status_update(engine))
        }
        Some("override") => {
            let mode = data.get("value").and_then(Value::as_str).unwrap_or("");
            match engine.set_override(mode).await {
                Ok(()) => Some(status_update(engine)),
                Err(e) => Some(ws_error(e.to_string())),
            }
        }
        other => Some(ws_error(format!("Unknown type: {other:?}"))),
    }
}

fn ws_percent_value(data: &Value) -> Result<Option<u8>, Value> {
    match data.get("value") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(n) if n <= u8::MAX as u64 => Ok(Some(n as u8)),
            _ => Err(ws_error("value must be an integer percentage")),
        },
    }
}
