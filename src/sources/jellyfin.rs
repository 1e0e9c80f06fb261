//! Jellyfin adapter.
//!
//! Jellyfin's REST surface descends from Emby's, so the wire structs and
//! normalization are shared with the Emby adapter; what differs is the
//! authentication scheme and a handful of endpoint details.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::time::Instant;
use tracing::debug;

use super::emby::{library_item_from_emby, normalize_emby_session, EmbySession};
use super::{build_http_client, MediaServerClient, DEFAULT_TIMEOUT, SESSIONS_TIMEOUT};
use crate::config::ServerConfig;
use crate::errors::SourceError;
use crate::models::{
    HealthStatus, HistoryEntry, LibraryItem, NormalizedSession, ServerKind, SystemInfo, User,
    UserDataItem,
};

pub struct JellyfinClient {
    server_id: String,
    display_name: String,
    base_url: String,
    api_key: String,
    http: Client,
}

impl JellyfinClient {
    pub fn new(config: &ServerConfig) -> Result<Self, SourceError> {
        Ok(Self {
            server_id: config.id.clone(),
            display_name: config.display_name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.credential.clone(),
            http: build_http_client(DEFAULT_TIMEOUT, config.accept_invalid_certs)?,
        })
    }

    fn auth_header(&self) -> String {
        format!(
            "MediaBrowser Client=\"playtally\", Device=\"playtally\", DeviceId=\"playtally\", Version=\"{}\", Token=\"{}\"",
            env!("CARGO_PKG_VERSION"),
            self.api_key
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        timeout: std::time::Duration,
    ) -> Result<T, SourceError> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::auth_failed("jellyfin", format!("{status}")));
        }
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: url,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::parse_error("jellyfin", e.to_string()))
    }

    async fn post_empty(&self, path: &str) -> Result<(), SourceError> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: url,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaServerClient for JellyfinClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> ServerKind {
        ServerKind::Jellyfin
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn get_active_sessions(&self) -> Result<Vec<NormalizedSession>, SourceError> {
        let raw: Vec<EmbySession> = self.get_json("/Sessions", SESSIONS_TIMEOUT).await?;
        let sessions: Vec<NormalizedSession> = raw
            .iter()
            .filter_map(|s| normalize_emby_session(&self.server_id, ServerKind::Jellyfin, s))
            .collect();
        debug!(
            server_id = %self.server_id,
            total = raw.len(),
            playing = sessions.len(),
            "fetched jellyfin sessions"
        );
        Ok(sessions)
    }

    async fn get_system_info(&self) -> Result<SystemInfo, SourceError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Info {
            server_name: Option<String>,
            version: Option<String>,
            id: Option<String>,
        }
        let info: Info = self.get_json("/System/Info", DEFAULT_TIMEOUT).await?;
        Ok(SystemInfo {
            server_name: info.server_name.unwrap_or_default(),
            version: info.version.unwrap_or_default(),
            id: info.id.unwrap_or_default(),
        })
    }

    async fn get_users(&self) -> Result<Vec<User>, SourceError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct JellyfinUser {
            id: String,
            name: Option<String>,
        }
        let raw: Vec<JellyfinUser> = self.get_json("/Users", DEFAULT_TIMEOUT).await?;
        Ok(raw
            .into_iter()
            .map(|u| User {
                display_name: u.name.unwrap_or_else(|| u.id.clone()),
                id: u.id,
                server_id: self.server_id.clone(),
                server_type: ServerKind::Jellyfin,
            })
            .collect())
    }

    async fn get_user_data(&self, user_id: &str) -> Result<Vec<UserDataItem>, SourceError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Page {
            items: Option<Vec<Entry>>,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Entry {
            #[serde(flatten)]
            item: super::emby::EmbyItem,
            user_data: Option<UserData>,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct UserData {
            played: Option<bool>,
            play_count: Option<i64>,
            last_played_date: Option<String>,
        }

        let path = format!(
            "/Users/{user_id}/Items?Recursive=true&IncludeItemTypes=Movie,Episode&Filters=IsPlayed&Fields=RunTimeTicks,Path,Genres,MediaStreams"
        );
        let page: Page = self.get_json(&path, SESSIONS_TIMEOUT).await?;
        Ok(page
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let user_data = entry.user_data.as_ref();
                UserDataItem {
                    item: library_item_from_emby(&self.server_id, &entry.item),
                    played: user_data.and_then(|u| u.played).unwrap_or(false),
                    play_count: user_data.and_then(|u| u.play_count).unwrap_or(0),
                    last_played: user_data
                        .and_then(|u| u.last_played_date.as_deref())
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                }
            })
            .collect())
    }

    async fn items_by_ids(&self, ids: &[String]) -> Result<Vec<LibraryItem>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Page {
            items: Option<Vec<super::emby::EmbyItem>>,
        }
        let path = format!(
            "/Items?Ids={}&Fields=RunTimeTicks,Path,Genres,MediaStreams",
            ids.join(",")
        );
        let page: Page = self.get_json(&path, DEFAULT_TIMEOUT).await?;
        Ok(page
            .items
            .unwrap_or_default()
            .iter()
            .map(|item| library_item_from_emby(&self.server_id, item))
            .collect())
    }

    async fn get_user_play_history(
        &self,
        user_id: &str,
        days_back: u32,
    ) -> Result<Vec<HistoryEntry>, SourceError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_back));
        let data = self.get_user_data(user_id).await?;
        Ok(data
            .into_iter()
            .filter(|entry| entry.last_played.map(|ts| ts >= cutoff).unwrap_or(false))
            .map(|entry| HistoryEntry {
                item_id: entry.item.id.clone(),
                item_name: entry.item.name.clone(),
                played_at: entry.last_played,
            })
            .collect())
    }

    async fn pause_session(&self, session_id: &str) -> Result<(), SourceError> {
        self.post_empty(&format!("/Sessions/{session_id}/Playing/Pause"))
            .await
    }

    async fn unpause_session(&self, session_id: &str) -> Result<(), SourceError> {
        self.post_empty(&format!("/Sessions/{session_id}/Playing/Unpause"))
            .await
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), SourceError> {
        self.post_empty(&format!("/Sessions/{session_id}/Playing/Stop"))
            .await
    }

    async fn send_message(
        &self,
        session_id: &str,
        header: &str,
        text: &str,
        timeout_ms: u64,
    ) -> Result<(), SourceError> {
        let url = self.url(&format!("/Sessions/{session_id}/Message"));
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({
                "Header": header,
                "Text": text,
                "TimeoutMs": timeout_ms,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: url,
            });
        }
        Ok(())
    }

    async fn check_health(&self) -> HealthStatus {
        let start = Instant::now();
        match self.get_system_info().await {
            Ok(_) => HealthStatus {
                reachable: true,
                response_time_ms: start.elapsed().as_millis() as u64,
                error: None,
            },
            Err(e) => HealthStatus {
                reachable: false,
                response_time_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }
}
