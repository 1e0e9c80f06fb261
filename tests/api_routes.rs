//! HTTP surface tests against the real router with an in-memory store.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use playtally::cache::SessionCache;
use playtally::config::Config;
use playtally::database::Database;
use playtally::intervalizer::Intervalizer;
use playtally::poller::Poller;
use playtally::sources::SourceManager;
use playtally::stats::StatsService;
use playtally::web::{AppState, WebServer};

async fn test_app() -> (Router, Database) {
    let config = Config::default();
    let db = Database::new_in_memory().await.unwrap();
    let cache = SessionCache::new(Duration::from_secs(15));
    let manager = Arc::new(SourceManager::new(Vec::new()));
    let intervalizer = Intervalizer::new(db.clone(), config.intervalizer.clone());
    let stats = StatsService::new(
        db.clone(),
        intervalizer.clone(),
        manager.clone(),
        config.stats.clone(),
    );
    let poller = Poller::new(
        manager.clone(),
        cache.clone(),
        intervalizer.clone(),
        db.clone(),
        config.stats.clone(),
        Duration::from_secs(5),
    );

    let state = AppState {
        config,
        db: db.clone(),
        cache,
        manager,
        intervalizer,
        poller,
        stats,
    };
    (WebServer::router(state), db)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let (app, _db) = test_app().await;
    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body.get("timestamp").is_some());
}

#[tokio::test]
async fn snapshot_is_an_empty_array_without_sessions() {
    let (app, _db) = test_app().await;
    let (status, body) = get_json(&app, "/api/now/snapshot").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));

    let (status, body) = get_json(&app, "/api/now/snapshot?server=plex").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn summary_reports_zeroes_when_idle() {
    let (app, _db) = test_app().await;
    let (status, body) = get_json(&app, "/api/now-playing/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outbound_mbps"], 0.0);
    assert_eq!(body["active_streams"], 0);
    assert_eq!(body["active_transcodes"], 0);
}

#[tokio::test]
async fn top_users_reflects_stored_intervals() {
    let (app, db) = test_app().await;

    let session = {
        use chrono::Utc;
        use playtally::models::{NormalizedSession, PlayMethod, ServerKind};
        NormalizedSession {
            server_id: "emby".into(),
            server_kind: ServerKind::Emby,
            session_id: "s1".into(),
            user_id: "u1".into(),
            user_name: "Alice".into(),
            item_id: "i1".into(),
            item_name: "Movie".into(),
            item_type: "Movie".into(),
            series_name: None,
            season_index: None,
            episode_index: None,
            position_ms: Some(0),
            duration_ms: None,
            client_name: String::new(),
            device_id: String::new(),
            device_name: String::new(),
            remote_address: String::new(),
            is_paused: false,
            play_method_raw: "DirectPlay".into(),
            play_method: PlayMethod::DirectPlay,
            video_method: PlayMethod::DirectPlay,
            audio_method: PlayMethod::DirectPlay,
            video_codec_from: None,
            video_codec_to: None,
            audio_codec_from: None,
            audio_codec_to: None,
            container: None,
            width: None,
            height: None,
            bitrate: None,
            dolby_vision: false,
            hdr10: false,
            audio_language: None,
            audio_channels: None,
            subtitle_language: None,
            subtitle_codec: None,
            transcode_reasons: vec![],
            transcode_progress: None,
            transcode_video_bitrate: None,
            transcode_audio_bitrate: None,
            last_seen: Utc::now(),
        }
    };

    let now = chrono::Utc::now().timestamp();
    let fk = db.upsert_play_session(&session, now - 3_600).await.unwrap();
    db.insert_interval(fk, "u1", "i1", now - 3_600, now - 1_800, 0, 0, false)
        .await
        .unwrap();

    let (status, body) = get_json(&app, "/stats/top/users?window=24h&limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let users = body.as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["user_id"], "u1");
    let hours = users[0]["hours"].as_f64().unwrap();
    assert!((hours - 0.5).abs() < 0.01);
}

#[tokio::test]
async fn control_on_unknown_server_is_not_found() {
    let (app, _db) = test_app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/now/sessions/nope/s1/stop")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn usage_and_user_detail_answer_empty_windows() {
    let (app, _db) = test_app().await;
    let (status, body) = get_json(&app, "/stats/usage?window=7d").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    let (status, body) = get_json(&app, "/stats/users/ghost?window=7d").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "ghost");
    assert_eq!(body["hours"], 0.0);
}
