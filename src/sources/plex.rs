//! Plex adapter.
//!
//! Plex answers `/status/sessions` with XML; positions are already in
//! milliseconds. Remote control of arbitrary players is not part of the
//! Plex server API, so pause and messaging report as unsupported while
//! stop maps to session termination.

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

pub struct PlexClient {
    server_id: String,
    display_name: String,
    base_url: String,
    token: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexMediaContainer {
    #[serde(rename = "Video", default)]
    pub videos: Vec<PlexVideo>,
    #[serde(rename = "@machineIdentifier")]
    pub machine_identifier: Option<String>,
    #[serde(rename = "@version")]
    pub version: Option<String>,
    #[serde(rename = "@friendlyName")]
    pub friendly_name: Option<String>,
    #[serde(rename = "Account", default)]
    pub accounts: Vec<PlexAccount>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexVideo {
    #[serde(rename = "@sessionKey")]
    pub session_key: Option<String>,
    #[serde(rename = "@ratingKey")]
    pub rating_key: Option<String>,
    #[serde(rename = "@title")]
    pub title: Option<String>,
    #[serde(rename = "@grandparentTitle")]
    pub grandparent_title: Option<String>,
    #[serde(rename = "@parentIndex")]
    pub parent_index: Option<i64>,
    #[serde(rename = "@index")]
    pub index: Option<i64>,
    #[serde(rename = "@type")]
    pub item_type: Option<String>,
    #[serde(rename = "@live")]
    pub live: Option<String>,
    #[serde(rename = "@viewOffset")]
    pub view_offset: Option<i64>,
    #[serde(rename = "@duration")]
    pub duration: Option<i64>,
    #[serde(rename = "User")]
    pub user: Option<PlexUser>,
    #[serde(rename = "Player")]
    pub player: Option<PlexPlayer>,
    #[serde(rename = "Session")]
    pub session: Option<PlexSessionInfo>,
    #[serde(rename = "Media", default)]
    pub media: Vec<PlexMedia>,
    #[serde(rename = "TranscodeSession")]
    pub transcode: Option<PlexTranscodeSession>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexUser {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@title")]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexPlayer {
    #[serde(rename = "@machineIdentifier")]
    pub machine_identifier: Option<String>,
    #[serde(rename = "@product")]
    pub product: Option<String>,
    #[serde(rename = "@title")]
    pub title: Option<String>,
    #[serde(rename = "@address")]
    pub address: Option<String>,
    #[serde(rename = "@state")]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexSessionInfo {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexMedia {
    #[serde(rename = "@bitrate")]
    pub bitrate: Option<i64>,
    #[serde(rename = "@container")]
    pub container: Option<String>,
    #[serde(rename = "@videoCodec")]
    pub video_codec: Option<String>,
    #[serde(rename = "@audioCodec")]
    pub audio_codec: Option<String>,
    #[serde(rename = "@width")]
    pub width: Option<i64>,
    #[serde(rename = "@height")]
    pub height: Option<i64>,
    #[serde(rename = "@audioChannels")]
    pub audio_channels: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexTranscodeSession {
    #[serde(rename = "@videoDecision")]
    pub video_decision: Option<String>,
    #[serde(rename = "@audioDecision")]
    pub audio_decision: Option<String>,
    #[serde(rename = "@subtitleDecision")]
    pub subtitle_decision: Option<String>,
    #[serde(rename = "@videoCodec")]
    pub video_codec: Option<String>,
    #[serde(rename = "@audioCodec")]
    pub audio_codec: Option<String>,
    #[serde(rename = "@progress")]
    pub progress: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlexAccount {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@name")]
    pub name: Option<String>,
}

fn decision_is_transcode(decision: Option<&str>) -> bool {
    decision
        .map(|d| d.eq_ignore_ascii_case("transcode"))
        .unwrap_or(false)
}

/// Normalize one `/status/sessions` video element.
pub(crate) fn normalize_plex_video(server_id: &str, video: &PlexVideo) -> Option<NormalizedSession> {
    let session_id = video
        .session
        .as_ref()
        .and_then(|s| s.id.clone())
        .or_else(|| video.session_key.clone())?;
    let item_id = video.rating_key.clone()?;

    let media = video.media.first();
    let player = video.player.as_ref();
    let transcode = video.transcode.as_ref();

    let video_from = media.and_then(|m| m.video_codec.clone());
    let audio_from = media.and_then(|m| m.audio_codec.clone());
    let video_to = transcode.and_then(|t| {
        if decision_is_transcode(t.video_decision.as_deref()) {
            t.video_codec.clone()
        } else {
            video_from.clone()
        }
    });
    let audio_to = transcode.and_then(|t| {
        if decision_is_transcode(t.audio_decision.as_deref()) {
            t.audio_codec.clone()
        } else {
            audio_from.clone()
        }
    });

    let mut reasons = Vec::new();
    if transcode
        .and_then(|t| t.subtitle_decision.as_deref())
        .map(|d| d.eq_ignore_ascii_case("burn"))
        .unwrap_or(false)
    {
        reasons.push("SubtitleBurnIn".to_string());
    }

    let play_method_raw = match transcode {
        Some(t)
            if decision_is_transcode(t.video_decision.as_deref())
                || decision_is_transcode(t.audio_decision.as_deref()) =>
        {
            "Transcode".to_string()
        }
        _ => "DirectPlay".to_string(),
    };

    let classification = classify::classify_methods(
        &play_method_raw,
        &reasons,
        video_from.as_deref(),
        video_to.as_deref(),
        audio_from.as_deref(),
        audio_to.as_deref(),
    );

    // Plex marks live streams either with the live flag or a clip-like
    // item type; map them to the shared live-TV type name.
    let item_type = if video.live.as_deref() == Some("1") {
        "LiveTv".to_string()
    } else {
        video.item_type.clone().unwrap_or_default()
    };

    Some(NormalizedSession {
        server_id: server_id.to_string(),
        server_kind: ServerKind::Plex,
        session_id,
        user_id: video
            .user
            .as_ref()
            .and_then(|u| u.id.clone())
            .unwrap_or_default(),
        user_name: video
            .user
            .as_ref()
            .and_then(|u| u.title.clone())
            .unwrap_or_default(),
        item_id,
        item_name: video.title.clone().unwrap_or_default(),
        item_type,
        series_name: video.grandparent_title.clone(),
        season_index: video.parent_index,
        episode_index: video.index,
        position_ms: video.view_offset,
        duration_ms: video.duration,
        client_name: player.and_then(|p| p.product.clone()).unwrap_or_default(),
        device_id: player
            .and_then(|p| p.machine_identifier.clone())
            .unwrap_or_default(),
        device_name: player.and_then(|p| p.title.clone()).unwrap_or_default(),
        remote_address: player.and_then(|p| p.address.clone()).unwrap_or_default(),
        is_paused: player
            .and_then(|p| p.state.as_deref())
            .map(|s| s.eq_ignore_ascii_case("paused"))
            .unwrap_or(false),
        play_method_raw,
        play_method: classification.play_method,
        video_method: classification.video_method,
        audio_method: classification.audio_method,
        video_codec_from: video_from,
        video_codec_to: video_to,
        audio_codec_from: audio_from,
        audio_codec_to: audio_to,
        container: media.and_then(|m| m.container.clone()),
        width: media.and_then(|m| m.width),
        height: media.and_then(|m| m.height),
        bitrate: media
            .and_then(|m| m.bitrate)
            .map(|kbps| kbps * 1000)
            .or_else(|| video.session.as_ref().and_then(|s| s.bandwidth).map(|kbps| kbps * 1000)),
        dolby_vision: false,
        hdr10: false,
        audio_language: None,
        audio_channels: media.and_then(|m| m.audio_channels),
        subtitle_language: None,
        subtitle_codec: None,
        transcode_reasons: reasons,
        transcode_progress: transcode.and_then(|t| t.progress),
        transcode_video_bitrate: None,
        transcode_audio_bitrate: None,
        last_seen: Utc::now(),
    })
}

impl PlexClient {
    pub fn new(config: &ServerConfig) -> Result<Self, SourceError> {
        Ok(Self {
            server_id: config.id.clone(),
            display_name: config.display_name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.credential.clone(),
            http: build_http_client(DEFAULT_TIMEOUT, config.accept_invalid_certs)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_xml(
        &self,
        path: &str,
        timeout: std::time::Duration,
    ) -> Result<PlexMediaContainer, SourceError> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/xml")
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::auth_failed("plex", format!("{status}")));
        }
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: url,
            });
        }
        let body = response.text().await?;
        quick_xml::de::from_str(&body).map_err(|e| SourceError::parse_error("plex", e.to_string()))
    }
}

#[async_trait]
impl MediaServerClient for PlexClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> ServerKind {
        ServerKind::Plex
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn get_active_sessions(&self) -> Result<Vec<NormalizedSession>, SourceError> {
        let container = self.get_xml("/status/sessions", SESSIONS_TIMEOUT).await?;
        let sessions: Vec<NormalizedSession> = container
            .videos
            .iter()
            .filter_map(|v| normalize_plex_video(&self.server_id, v))
            .collect();
        debug!(
            server_id = %self.server_id,
            playing = sessions.len(),
            "fetched plex sessions"
        );
        Ok(sessions)
    }

    async fn get_system_info(&self) -> Result<SystemInfo, SourceError> {
        let container = self.get_xml("/identity", DEFAULT_TIMEOUT).await?;
        Ok(SystemInfo {
            server_name: container.friendly_name.unwrap_or_default(),
            version: container.version.unwrap_or_default(),
            id: container.machine_identifier.unwrap_or_default(),
        })
    }

    async fn get_users(&self) -> Result<Vec<User>, SourceError> {
        let container = self.get_xml("/accounts", DEFAULT_TIMEOUT).await?;
        Ok(container
            .accounts
            .iter()
            .filter_map(|account| {
                let id = account.id.clone()?;
                Some(User {
                    display_name: account.name.clone().unwrap_or_else(|| id.clone()),
                    id,
                    server_id: self.server_id.clone(),
                    server_type: ServerKind::Plex,
                })
            })
            .collect())
    }

    async fn get_user_data(&self, _user_id: &str) -> Result<Vec<UserDataItem>, SourceError> {
        Err(SourceError::unsupported("per-user watch data", "plex"))
    }

    async fn items_by_ids(&self, ids: &[String]) -> Result<Vec<LibraryItem>, SourceError> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let container = self
                .get_xml(&format!("/library/metadata/{id}"), DEFAULT_TIMEOUT)
                .await?;
            for video in &container.videos {
                let media = video.media.first();
                items.push(LibraryItem {
                    id: video.rating_key.clone().unwrap_or_else(|| id.clone()),
                    server_id: self.server_id.clone(),
                    item_type: video.item_type.clone().unwrap_or_default(),
                    name: video.title.clone().unwrap_or_default(),
                    series_id: None,
                    series_name: video.grandparent_title.clone(),
                    season_index: video.parent_index,
                    episode_index: video.index,
                    runtime_ticks: video.duration.map(crate::utils::time::ms_to_ticks),
                    container: media.and_then(|m| m.container.clone()),
                    video_codec: media.and_then(|m| m.video_codec.clone()),
                    audio_codec: media.and_then(|m| m.audio_codec.clone()),
                    resolution: media.and_then(|m| match (m.width, m.height) {
                        (Some(w), Some(h)) => Some(format!("{w}x{h}")),
                        _ => None,
                    }),
                    file_path: None,
                    genres: None,
                });
            }
        }
        Ok(items)
    }

    async fn get_user_play_history(
        &self,
        _user_id: &str,
        _days_back: u32,
    ) -> Result<Vec<HistoryEntry>, SourceError> {
        Err(SourceError::unsupported("play history", "plex"))
    }

    async fn pause_session(&self, _session_id: &str) -> Result<(), SourceError> {
        Err(SourceError::unsupported("remote pause", "plex"))
    }

    async fn unpause_session(&self, _session_id: &str) -> Result<(), SourceError> {
        Err(SourceError::unsupported("remote unpause", "plex"))
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), SourceError> {
        let url = self.url(&format!(
            "/status/sessions/terminate?sessionId={session_id}&reason=Stopped%20by%20administrator"
        ));
        let response = self
            .http
            .get(&url)
            .header("X-Plex-Token", &self.token)
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

    async fn send_message(
        &self,
        _session_id: &str,
        _header: &str,
        _text: &str,
        _timeout_ms: u64,
    ) -> Result<(), SourceError> {
        Err(SourceError::unsupported("on-screen message", "plex"))
    }

    async fn check_health(&self) -> HealthStatus {
        let start = Instant::now();
        match self.get_xml("/identity", DEFAULT_TIMEOUT).await {
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
