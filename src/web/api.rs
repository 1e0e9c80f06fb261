use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use super::AppState;
use crate::utils::time::{now_ts, parse_window};

#[derive(Debug, Deserialize)]
pub struct WindowParams {
    pub window: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    pub server: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PauseBody {
    #[serde(default = "default_paused")]
    pub paused: bool,
}

fn default_paused() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub header: String,
    pub text: String,
    #[serde(default = "default_message_timeout")]
    pub timeout_ms: u64,
}

fn default_message_timeout() -> u64 {
    5_000
}

#[derive(Debug, Serialize)]
pub struct ServerEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub display_name: String,
    pub reachable: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn detailed_health_check(State(state): State<AppState>) -> Json<Value> {
    let servers = state.manager.check_health_all().await;
    let server_health: Vec<Value> = servers
        .into_iter()
        .map(|(id, kind, health)| {
            json!({
                "id": id,
                "type": kind.as_str(),
                "reachable": health.reachable,
                "response_time_ms": health.response_time_ms,
                "error": health.error,
            })
        })
        .collect();

    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "servers": server_health,
        "cache": state.cache.get_metrics(),
        "tracked_sessions": state.intervalizer.tracked_count().await,
    }))
}

pub async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerEntry>> {
    let health = state.manager.check_health_all().await;
    let entries = health
        .into_iter()
        .map(|(id, kind, status)| {
            let display_name = state
                .config
                .servers
                .iter()
                .find(|s| s.id == id)
                .map(|s| s.display_name.clone())
                .unwrap_or_else(|| id.clone());
            ServerEntry {
                id,
                kind: kind.as_str().to_string(),
                display_name,
                reachable: status.reachable,
                response_time_ms: status.response_time_ms,
                error: status.error,
            }
        })
        .collect();
    Json(entries)
}

pub async fn now_snapshot(
    Query(params): Query<SnapshotParams>,
    State(state): State<AppState>,
) -> Json<Vec<crate::models::NowEntry>> {
    let entries = state.poller.snapshot_for(params.server.as_deref()).await;
    Json(entries)
}

pub async fn now_playing_summary(
    State(state): State<AppState>,
) -> Json<crate::models::NowPlayingSummary> {
    Json(state.poller.summary().await)
}

pub async fn top_users(
    Query(params): Query<WindowParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::stats::TopUser>>, StatusCode> {
    let now = now_ts();
    let (w0, w1) = parse_window(params.window.as_deref(), now);
    match state
        .stats
        .top_users(w0, w1, now, params.limit.unwrap_or(10))
        .await
    {
        Ok(users) => Ok(Json(users)),
        Err(e) => {
            error!("Failed to compute top users: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn lifetime_top_users(
    Query(params): Query<WindowParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::stats::LifetimeTopUser>>, StatusCode> {
    match state
        .stats
        .lifetime_top_users(params.limit.unwrap_or(10) as i64)
        .await
    {
        Ok(users) => Ok(Json(users)),
        Err(e) => {
            error!("Failed to compute lifetime top users: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn top_items(
    Query(params): Query<WindowParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::stats::TopItem>>, StatusCode> {
    let now = now_ts();
    let (w0, w1) = parse_window(params.window.as_deref(), now);
    match state
        .stats
        .top_items(w0, w1, now, params.limit.unwrap_or(10))
        .await
    {
        Ok(items) => Ok(Json(items)),
        Err(e) => {
            error!("Failed to compute top items: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn usage(
    Query(params): Query<WindowParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::stats::UsageBucket>>, StatusCode> {
    let now = now_ts();
    let (w0, w1) = parse_window(params.window.as_deref(), now);
    match state.stats.usage_histogram(w0, w1, now).await {
        Ok(usage) => Ok(Json(usage)),
        Err(e) => {
            error!("Failed to compute usage: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn user_detail(
    Path(user_id): Path<String>,
    Query(params): Query<WindowParams>,
    State(state): State<AppState>,
) -> Result<Json<crate::stats::UserDetail>, StatusCode> {
    let now = now_ts();
    let (w0, w1) = parse_window(params.window.as_deref(), now);
    match state.stats.user_detail(&user_id, w0, w1, now).await {
        Ok(detail) => Ok(Json(detail)),
        Err(e) => {
            error!("Failed to compute user detail: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn control_error(e: crate::errors::SourceError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        crate::errors::SourceError::UnknownServer { .. } => StatusCode::NOT_FOUND,
        crate::errors::SourceError::UnsupportedFeature { .. } => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

pub async fn pause_session(
    Path((server, session_id)): Path<(String, String)>,
    State(state): State<AppState>,
    body: Option<Json<PauseBody>>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let client = state.manager.client(&server).map_err(control_error)?;
    let paused = body.map(|Json(b)| b.paused).unwrap_or(true);
    let result = if paused {
        client.pause_session(&session_id).await
    } else {
        client.unpause_session(&session_id).await
    };
    result.map_err(control_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_session(
    Path((server, session_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let client = state.manager.client(&server).map_err(control_error)?;
    client
        .stop_session(&session_id)
        .await
        .map_err(control_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn message_session(
    Path((server, session_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<MessageBody>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let client = state.manager.client(&server).map_err(control_error)?;
    client
        .send_message(&session_id, &body.header, &body.text, body.timeout_ms)
        .await
        .map_err(control_error)?;
    Ok(StatusCode::NO_CONTENT)
}
