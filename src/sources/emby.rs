//! Emby adapter.
//!
//! Speaks the Emby REST API with JSON payloads. The wire structs here are
//! shared with the push-stream client, which receives the same session
//! shape over the websocket.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Instant;
use tracing::debug;

use super::{build_http_client, classify, MediaServerClient, DEFAULT_TIMEOUT, SESSIONS_TIMEOUT};
use crate::config::ServerConfig;
use crate::errors::SourceError;
use crate::models::{
    HealthStatus, HistoryEntry, LibraryItem, NormalizedSession, ServerKind, SystemInfo, User,
    UserDataItem,
};

pub struct EmbyClient {
    server_id: String,
    display_name: String,
    base_url: String,
    api_key: String,
    http: Client,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EmbySession {
    pub id: String,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub client: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub remote_end_point: Option<String>,
    pub now_playing_item: Option<EmbyItem>,
    pub play_state: Option<EmbyPlayState>,
    pub transcoding_info: Option<EmbyTranscodingInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EmbyItem {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "Type")]
    pub item_type: Option<String>,
    pub run_time_ticks: Option<i64>,
    pub series_id: Option<String>,
    pub series_name: Option<String>,
    pub parent_index_number: Option<i64>,
    pub index_number: Option<i64>,
    pub container: Option<String>,
    pub path: Option<String>,
    pub genres: Option<Vec<String>>,
    pub media_streams: Option<Vec<EmbyMediaStream>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EmbyPlayState {
    pub position_ticks: Option<i64>,
    pub is_paused: Option<bool>,
    pub play_method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EmbyMediaStream {
    #[serde(rename = "Type")]
    pub stream_type: Option<String>,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub channels: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bit_rate: Option<i64>,
    pub video_range: Option<String>,
    pub is_default: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EmbyTranscodingInfo {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bitrate: Option<i64>,
    pub completion_percentage: Option<f64>,
    pub transcode_reasons: Option<Vec<String>>,
    pub is_video_direct: Option<bool>,
    pub is_audio_direct: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbySystemInfo {
    server_name: Option<String>,
    version: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbyUser {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbyItemsPage {
    items: Option<Vec<EmbyUserDataItem>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbyUserDataItem {
    #[serde(flatten)]
    item: EmbyItem,
    user_data: Option<EmbyUserData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbyUserData {
    played: Option<bool>,
    play_count: Option<i64>,
    last_played_date: Option<String>,
}

impl EmbyClient {
    pub fn new(config: &ServerConfig) -> Result<Self, SourceError> {
        Ok(Self {
            server_id: config.id.clone(),
            display_name: config.display_name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.credential.clone(),
            http: build_http_client(DEFAULT_TIMEOUT, config.accept_invalid_certs)?,
        })
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
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::auth_failed("emby", format!("{status}")));
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
            .map_err(|e| SourceError::parse_error("emby", e.to_string()))
    }

    async fn post_empty(&self, path: &str) -> Result<(), SourceError> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .header("X-Emby-Token", &self.api_key)
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

    /// Normalize one raw session. Sessions without a now-playing item are
    /// idle and dropped.
    pub(crate) fn normalize(&self, raw: &EmbySession) -> Option<NormalizedSession> {
        normalize_emby_session(&self.server_id, ServerKind::Emby, raw)
    }
}

/// Shared normalization for REST and push payloads.
pub(crate) fn normalize_emby_session(
    server_id: &str,
    kind: ServerKind,
    raw: &EmbySession,
) -> Option<NormalizedSession> {
    let item = raw.now_playing_item.as_ref()?;
    let play_state = raw.play_state.as_ref();
    let transcoding = raw.transcoding_info.as_ref();

    let streams = item.media_streams.as_deref().unwrap_or(&[]);
    let video_stream = streams
        .iter()
        .find(|s| s.stream_type.as_deref() == Some("Video"));
    let audio_stream = streams
        .iter()
        .filter(|s| s.stream_type.as_deref() == Some("Audio"))
        .max_by_key(|s| s.is_default.unwrap_or(false))
        .or_else(|| {
            streams
                .iter()
                .find(|s| s.stream_type.as_deref() == Some("Audio"))
        });
    let subtitle_stream = streams
        .iter()
        .find(|s| s.stream_type.as_deref() == Some("Subtitle"));

    let video_codec_from = video_stream.and_then(|s| s.codec.clone());
    let audio_codec_from = audio_stream.and_then(|s| s.codec.clone());
    let video_codec_to = transcoding.and_then(|t| match t.is_video_direct {
        Some(true) => video_codec_from.clone(),
        _ => t.video_codec.clone(),
    });
    let audio_codec_to = transcoding.and_then(|t| match t.is_audio_direct {
        Some(true) => audio_codec_from.clone(),
        _ => t.audio_codec.clone(),
    });

    let reasons: Vec<String> = transcoding
        .and_then(|t| t.transcode_reasons.clone())
        .unwrap_or_default();
    let play_method_raw = play_state
        .and_then(|p| p.play_method.clone())
        .unwrap_or_default();

    let classification = classify::classify_methods(
        &play_method_raw,
        &reasons,
        video_codec_from.as_deref(),
        video_codec_to.as_deref(),
        audio_codec_from.as_deref(),
        audio_codec_to.as_deref(),
    );

    let video_range = video_stream
        .and_then(|s| s.video_range.clone())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let bitrate = transcoding
        .and_then(|t| t.bitrate)
        .or_else(|| streams.iter().filter_map(|s| s.bit_rate).max());

    Some(NormalizedSession {
        server_id: server_id.to_string(),
        server_kind: kind,
        session_id: raw.id.clone(),
        user_id: raw.user_id.clone().unwrap_or_default(),
        user_name: raw.user_name.clone().unwrap_or_default(),
        item_id: item.id.clone(),
        item_name: item.name.clone().unwrap_or_default(),
        item_type: item.item_type.clone().unwrap_or_default(),
        series_name: item.series_name.clone(),
        season_index: item.parent_index_number,
        episode_index: item.index_number,
        position_ms: play_state
            .and_then(|p| p.position_ticks)
            .map(crate::utils::time::ticks_to_ms),
        duration_ms: item.run_time_ticks.map(crate::utils::time::ticks_to_ms),
        client_name: raw.client.clone().unwrap_or_default(),
        device_id: raw.device_id.clone().unwrap_or_default(),
        device_name: raw.device_name.clone().unwrap_or_default(),
        remote_address: raw.remote_end_point.clone().unwrap_or_default(),
        is_paused: play_state.and_then(|p| p.is_paused).unwrap_or(false),
        play_method_raw,
        play_method: classification.play_method,
        video_method: classification.video_method,
        audio_method: classification.audio_method,
        video_codec_from,
        video_codec_to,
        audio_codec_from,
        audio_codec_to,
        container: item.container.clone(),
        width: video_stream.and_then(|s| s.width),
        height: video_stream.and_then(|s| s.height),
        bitrate,
        dolby_vision: video_range.contains("dovi") || video_range.contains("dolby"),
        hdr10: video_range.contains("hdr"),
        audio_language: audio_stream.and_then(|s| s.language.clone()),
        audio_channels: audio_stream.and_then(|s| s.channels),
        subtitle_language: subtitle_stream.and_then(|s| s.language.clone()),
        subtitle_codec: subtitle_stream.and_then(|s| s.codec.clone()),
        transcode_reasons: reasons,
        transcode_progress: transcoding.and_then(|t| t.completion_percentage),
        transcode_video_bitrate: None,
        transcode_audio_bitrate: None,
        last_seen: Utc::now(),
    })
}

pub(crate) fn library_item_from_emby(server_id: &str, item: &EmbyItem) -> LibraryItem {
    let streams = item.media_streams.as_deref().unwrap_or(&[]);
    let video_stream = streams
        .iter()
        .find(|s| s.stream_type.as_deref() == Some("Video"));
    let audio_stream = streams
        .iter()
        .find(|s| s.stream_type.as_deref() == Some("Audio"));
    LibraryItem {
        id: item.id.clone(),
        server_id: server_id.to_string(),
        item_type: item.item_type.clone().unwrap_or_default(),
        name: item.name.clone().unwrap_or_default(),
        series_id: item.series_id.clone(),
        series_name: item.series_name.clone(),
        season_index: item.parent_index_number,
        episode_index: item.index_number,
        runtime_ticks: item.run_time_ticks,
        container: item.container.clone(),
        video_codec: video_stream.and_then(|s| s.codec.clone()),
        audio_codec: audio_stream.and_then(|s| s.codec.clone()),
        resolution: video_stream.and_then(|s| match (s.width, s.height) {
            (Some(w), Some(h)) => Some(format!("{w}x{h}")),
            _ => None,
        }),
        file_path: item.path.clone(),
        genres: item.genres.as_ref().map(|g| g.join(",")),
    }
}

#[async_trait]
impl MediaServerClient for EmbyClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> ServerKind {
        ServerKind::Emby
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn get_active_sessions(&self) -> Result<Vec<NormalizedSession>, SourceError> {
        let raw: Vec<EmbySession> = self.get_json("/Sessions", SESSIONS_TIMEOUT).await?;
        let sessions: Vec<NormalizedSession> =
            raw.iter().filter_map(|s| self.normalize(s)).collect();
        debug!(
            server_id = %self.server_id,
            total = raw.len(),
            playing = sessions.len(),
            "fetched emby sessions"
        );
        Ok(sessions)
    }

    async fn get_system_info(&self) -> Result<SystemInfo, SourceError> {
        let info: EmbySystemInfo = self.get_json("/System/Info", DEFAULT_TIMEOUT).await?;
        Ok(SystemInfo {
            server_name: info.server_name.unwrap_or_default(),
            version: info.version.unwrap_or_default(),
            id: info.id.unwrap_or_default(),
        })
    }

    async fn get_users(&self) -> Result<Vec<User>, SourceError> {
        let raw: Vec<EmbyUser> = self.get_json("/Users", DEFAULT_TIMEOUT).await?;
        Ok(raw
            .into_iter()
            .map(|u| User {
                display_name: u.name.unwrap_or_else(|| u.id.clone()),
                id: u.id,
                server_id: self.server_id.clone(),
                server_type: ServerKind::Emby,
            })
            .collect())
    }

    async fn get_user_data(&self, user_id: &str) -> Result<Vec<UserDataItem>, SourceError> {
        let path = format!(
            "/Users/{user_id}/Items?Recursive=true&IncludeItemTypes=Movie,Episode&Filters=IsPlayed&Fields=RunTimeTicks,Path,Genres,MediaStreams"
        );
        let page: EmbyItemsPage = self.get_json(&path, SESSIONS_TIMEOUT).await?;
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
        let path = format!(
            "/Items?Ids={}&Fields=RunTimeTicks,Path,Genres,MediaStreams",
            ids.join(",")
        );
        let page: EmbyItemsPage = self.get_json(&path, DEFAULT_TIMEOUT).await?;
        Ok(page
            .items
            .unwrap_or_default()
            .iter()
            .map(|entry| library_item_from_emby(&self.server_id, &entry.item))
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
            .header("X-Emby-Token", &self.api_key)
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
        match self
            .get_json::<EmbySystemInfo>("/System/Info", DEFAULT_TIMEOUT)
            .await
        {
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
