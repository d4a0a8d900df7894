//! HTTP + WebSocket surface for the shell.
//!
//! Exposes the engine's boundary commands as a small typed route table and
//! pushes shell events (`slave-connection-status`, `desync-alert`) over a
//! WebSocket. Command errors come back as `{error}` JSON with the engine's
//! structured message.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine::{AppMode, ObsConnectConfig, ShellEvent, SyncEngine};
use crate::error::SyncError;
use crate::protocol::SyncTargetType;
use crate::settings::AppSettings;

/// Default API port.
pub const DEFAULT_API_PORT: u16 = 8130;

/// Shared state for API handlers.
pub struct ApiState {
    pub engine: SyncEngine,
}

/// API error response.
#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SetModeRequest {
    mode: AppMode,
}

#[derive(Debug, Default, Deserialize)]
struct MasterStartRequest {
    /// Defaults to the persisted master listen port.
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct SlaveConnectRequest {
    /// Defaults to the persisted master endpoint.
    host: Option<String>,
    port: Option<u16>,
}

/// Build the API router.
pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/version", get(version))
        .route("/api/obs/status", get(obs_status))
        .route("/api/obs/connect", post(obs_connect))
        .route("/api/obs/disconnect", post(obs_disconnect))
        .route("/api/obs/sources", get(obs_sources))
        .route("/api/mode", get(get_mode).put(set_mode))
        .route(
            "/api/sync-targets",
            get(get_sync_targets).put(set_sync_targets),
        )
        .route("/api/master/start", post(master_start))
        .route("/api/master/stop", post(master_stop))
        .route("/api/master/clients", get(master_clients))
        .route("/api/master/clients/count", get(master_client_count))
        .route("/api/master/slave-statuses", get(master_slave_statuses))
        .route("/api/master/resync", post(resync_all))
        .route("/api/master/resync/:client_id", post(resync_one))
        .route("/api/slave/connect", post(slave_connect))
        .route("/api/slave/disconnect", post(slave_disconnect))
        .route("/api/slave/status", get(slave_status))
        .route("/api/slave/reconnection", get(slave_reconnection))
        .route("/api/slave/resync-request", post(slave_resync_request))
        .route("/api/metrics", get(metrics))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/ws/events", get(events_ws))
        .with_state(state)
}

/// GET /api/health
async fn health_check() -> &'static str {
    "ok"
}

/// GET /api/version
async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": SyncEngine::app_version(),
        "gitCommit": SyncEngine::git_commit(),
    }))
}

/// GET /api/obs/status
async fn obs_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.engine.get_obs_status().await)
}

/// POST /api/obs/connect
async fn obs_connect(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<ObsConnectConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.connect_obs(&config).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// POST /api/obs/disconnect
async fn obs_disconnect(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.engine.disconnect_obs().await;
    Json(serde_json::json!({"ok": true}))
}

/// GET /api/obs/sources
async fn obs_sources(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<crate::obs::types::SourceInfo>>, ApiError> {
    Ok(Json(state.engine.get_obs_sources().await?))
}

/// GET /api/mode
async fn get_mode(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"mode": state.engine.get_app_mode()}))
}

/// PUT /api/mode
async fn set_mode(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SetModeRequest>,
) -> Json<serde_json::Value> {
    state.engine.set_app_mode(req.mode);
    Json(serde_json::json!({"ok": true}))
}

/// GET /api/sync-targets
async fn get_sync_targets(State(state): State<Arc<ApiState>>) -> Json<Vec<SyncTargetType>> {
    Json(state.engine.get_sync_targets())
}

/// PUT /api/sync-targets
async fn set_sync_targets(
    State(state): State<Arc<ApiState>>,
    Json(targets): Json<Vec<SyncTargetType>>,
) -> Json<serde_json::Value> {
    state.engine.set_sync_targets(&targets);
    Json(serde_json::json!({"ok": true}))
}

/// POST /api/master/start
async fn master_start(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<MasterStartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let port = match req.port {
        Some(port) => port,
        None => state.engine.load_settings()?.master.listen_port,
    };
    state.engine.start_master_server(port).await?;
    Ok(Json(serde_json::json!({"ok": true, "port": port})))
}

/// POST /api/master/stop
async fn master_stop(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.stop_master_server().await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// GET /api/master/clients
async fn master_clients(
    State(state): State<Arc<ApiState>>,
) -> Json<Vec<crate::master::ClientInfo>> {
    Json(state.engine.get_connected_clients_info().await)
}

/// GET /api/master/clients/count
async fn master_client_count(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "connectedClients": state.engine.get_connected_clients_count().await
    }))
}

/// GET /api/master/slave-statuses
async fn master_slave_statuses(
    State(state): State<Arc<ApiState>>,
) -> Json<Vec<crate::master::SlaveStatus>> {
    Json(state.engine.get_slave_statuses().await)
}

/// POST /api/master/resync
async fn resync_all(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.resync_all_slaves().await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// POST /api/master/resync/:client_id
async fn resync_one(
    Path(client_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.resync_specific_slave(&client_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// POST /api/slave/connect
async fn slave_connect(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SlaveConnectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let defaults = state.engine.load_settings()?.slave;
    let host = req.host.unwrap_or(defaults.master_host);
    let port = req.port.unwrap_or(defaults.master_port);
    state.engine.connect_to_master(&host, port).await?;
    Ok(Json(
        serde_json::json!({"ok": true, "host": host, "port": port}),
    ))
}

/// POST /api/slave/disconnect
async fn slave_disconnect(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.engine.disconnect_from_master();
    Json(serde_json::json!({"ok": true}))
}

/// GET /api/slave/status
async fn slave_status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"state": state.engine.get_slave_link_state()}))
}

/// GET /api/slave/reconnection
async fn slave_reconnection(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.engine.get_slave_reconnection_status()))
}

/// POST /api/slave/resync-request
async fn slave_resync_request(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.request_resync_from_master()?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// GET /api/metrics
async fn metrics(State(state): State<Arc<ApiState>>) -> Json<crate::metrics::PerfMetrics> {
    Json(state.engine.get_performance_metrics())
}

/// GET /api/settings
async fn get_settings(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<AppSettings>, ApiError> {
    Ok(Json(state.engine.load_settings()?))
}

/// PUT /api/settings
async fn put_settings(
    State(state): State<Arc<ApiState>>,
    Json(settings): Json<AppSettings>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.save_settings(&settings)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// GET /api/ws/events - WebSocket push of shell events
async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let rx = state.engine.subscribe_events();
    ws.on_upgrade(move |socket| handle_websocket(socket, rx))
}

/// Forward shell events to one WebSocket client.
async fn handle_websocket(mut socket: WebSocket, mut rx: broadcast::Receiver<ShellEvent>) {
    debug!("Shell event subscriber connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let msg = match serde_json::to_string(&event) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Failed to serialize shell event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(msg)).await.is_err() {
                            debug!("Shell event subscriber disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Shell event subscriber lagged by {} events", n);
                    }
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Shell event subscriber closed connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Shell event socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// Start the API server.
pub async fn start_server(state: Arc<ApiState>, port: u16) -> Result<()> {
    let router = build_router(state);

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting shell API on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
