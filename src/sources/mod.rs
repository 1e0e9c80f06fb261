//! Upstream media-server adapters.
//!
//! Each server type implements the same capability set behind
//! [`MediaServerClient`]; everything downstream of the adapters works with
//! normalized sessions only. The [`SourceManager`] fans calls out across
//! all enabled servers in parallel so one slow server never blocks the
//! others.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ServerConfig;
use crate::errors::SourceError;
use crate::models::{
    HealthStatus, HistoryEntry, LibraryItem, NormalizedSession, ServerKind, SystemInfo, User,
    UserDataItem,
};

pub mod classify;
pub mod emby;
pub mod jellyfin;
pub mod plex;

/// Default timeout for most upstream calls.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Session polls get more headroom; they are the hot path and some servers
/// answer slowly under load.
pub(crate) const SESSIONS_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform capability set of one upstream media server.
#[async_trait]
pub trait MediaServerClient: Send + Sync {
    fn server_id(&self) -> &str;
    fn kind(&self) -> ServerKind;
    fn display_name(&self) -> &str;

    async fn get_active_sessions(&self) -> Result<Vec<NormalizedSession>, SourceError>;
    async fn get_system_info(&self) -> Result<SystemInfo, SourceError>;
    async fn get_users(&self) -> Result<Vec<User>, SourceError>;
    async fn get_user_data(&self, user_id: &str) -> Result<Vec<UserDataItem>, SourceError>;
    async fn items_by_ids(&self, ids: &[String]) -> Result<Vec<LibraryItem>, SourceError>;
    async fn get_user_play_history(
        &self,
        user_id: &str,
        days_back: u32,
    ) -> Result<Vec<HistoryEntry>, SourceError>;

    async fn pause_session(&self, session_id: &str) -> Result<(), SourceError>;
    async fn unpause_session(&self, session_id: &str) -> Result<(), SourceError>;
    async fn stop_session(&self, session_id: &str) -> Result<(), SourceError>;
    async fn send_message(
        &self,
        session_id: &str,
        header: &str,
        text: &str,
        timeout_ms: u64,
    ) -> Result<(), SourceError>;

    async fn check_health(&self) -> HealthStatus;
}

/// Build the adapter for one configured server.
pub fn build_client(config: &ServerConfig) -> Result<Arc<dyn MediaServerClient>, SourceError> {
    let client: Arc<dyn MediaServerClient> = match config.kind {
        ServerKind::Emby => Arc::new(emby::EmbyClient::new(config)?),
        ServerKind::Jellyfin => Arc::new(jellyfin::JellyfinClient::new(config)?),
        ServerKind::Plex => Arc::new(plex::PlexClient::new(config)?),
    };
    Ok(client)
}

pub(crate) fn build_http_client(
    timeout: Duration,
    accept_invalid_certs: bool,
) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .user_agent(concat!("playtally/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(SourceError::from)
}

/// Outcome of one server's active-sessions fetch during a poll tick.
pub struct FetchOutcome {
    pub server_id: String,
    pub server_kind: ServerKind,
    pub result: Result<Vec<NormalizedSession>, SourceError>,
}

/// Owns the adapter set for all configured servers.
pub struct SourceManager {
    clients: Vec<Arc<dyn MediaServerClient>>,
    by_id: HashMap<String, Arc<dyn MediaServerClient>>,
}

impl SourceManager {
    pub fn new(clients: Vec<Arc<dyn MediaServerClient>>) -> Self {
        let by_id = clients
            .iter()
            .map(|client| (client.server_id().to_string(), client.clone()))
            .collect();
        Self { clients, by_id }
    }

    pub fn from_config(servers: &[ServerConfig]) -> Result<Self, SourceError> {
        let mut clients = Vec::new();
        for server in servers.iter().filter(|s| s.enabled) {
            clients.push(build_client(server)?);
        }
        Ok(Self::new(clients))
    }

    pub fn clients(&self) -> &[Arc<dyn MediaServerClient>] {
        &self.clients
    }

    pub fn client(&self, server_id: &str) -> Result<Arc<dyn MediaServerClient>, SourceError> {
        self.by_id
            .get(server_id)
            .cloned()
            .ok_or_else(|| SourceError::UnknownServer {
                server_id: server_id.to_string(),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Fetch active sessions from every server in parallel, one worker per
    /// server. Adapter-level timeouts bound each worker; an outer guard
    /// protects against adapters that stall without erroring.
    pub async fn fetch_all_active(&self) -> Vec<FetchOutcome> {
        let fetches = self.clients.iter().map(|client| {
            let client = client.clone();
            async move {
                let result = match tokio::time::timeout(
                    SESSIONS_TIMEOUT + Duration::from_secs(5),
                    client.get_active_sessions(),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::timeout(format!(
                        "active sessions fetch for {}",
                        client.server_id()
                    ))),
                };
                if let Err(ref e) = result {
                    warn!(server_id = client.server_id(), error = %e, "active sessions fetch failed");
                }
                FetchOutcome {
                    server_id: client.server_id().to_string(),
                    server_kind: client.kind(),
                    result,
                }
            }
        });
        join_all(fetches).await
    }

    pub async fn check_health_all(&self) -> Vec<(String, ServerKind, HealthStatus)> {
        let probes = self.clients.iter().map(|client| {
            let client = client.clone();
            async move {
                let health = client.check_health().await;
                (client.server_id().to_string(), client.kind(), health)
            }
        });
        join_all(probes).await
    }
}
