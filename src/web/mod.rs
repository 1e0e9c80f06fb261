//! HTTP and realtime interface.
//!
//! Thin handlers over the service layer: snapshots and summaries read the
//! session cache through the poller, stats queries go to the aggregation
//! service, control posts are dispatched to the owning server's adapter.

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{
    cache::SessionCache, config::Config, database::Database, intervalizer::Intervalizer,
    poller::Poller, sources::SourceManager, stats::StatsService,
};

pub mod api;
pub mod ws;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub cache: Arc<SessionCache>,
    pub manager: Arc<SourceManager>,
    pub intervalizer: Arc<Intervalizer>,
    pub poller: Arc<Poller>,
    pub stats: Arc<StatsService>,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        let app = Self::router(state);
        Ok(Self { app, addr })
    }

    /// Build the full route tree for the given state.
    pub fn router(state: AppState) -> Router {
        Router::new()
            // Health endpoints (no auth required)
            .route("/health", get(api::health_check))
            .route("/health/detailed", get(api::detailed_health_check))
            // Now playing
            .route("/api/servers", get(api::list_servers))
            .route("/api/now/snapshot", get(api::now_snapshot))
            .route("/api/now/ws", get(ws::now_playing_ws))
            .route("/api/now-playing/summary", get(api::now_playing_summary))
            // Session control
            .route(
                "/api/now/sessions/:server/:id/pause",
                post(api::pause_session),
            )
            .route(
                "/api/now/sessions/:server/:id/stop",
                post(api::stop_session),
            )
            .route(
                "/api/now/sessions/:server/:id/message",
                post(api::message_session),
            )
            // Stats
            .route("/stats/top/users", get(api::top_users))
            .route("/stats/top/users/lifetime", get(api::lifetime_top_users))
            .route("/stats/top/items", get(api::top_items))
            .route("/stats/usage", get(api::usage))
            .route("/stats/users/:id", get(api::user_detail))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
