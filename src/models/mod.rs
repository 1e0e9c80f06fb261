//! Domain models shared across the service.
//!
//! Upstream payloads differ per server type; everything past the source
//! adapters speaks the normalized shapes defined here. Positions are
//! 100ns ticks, timestamps unix seconds, unless a field name says
//! otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported upstream media-server types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Emby,
    Plex,
    Jellyfin,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Emby => "emby",
            ServerKind::Plex => "plex",
            ServerKind::Jellyfin => "jellyfin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emby" => Some(ServerKind::Emby),
            "plex" => Some(ServerKind::Plex),
            "jellyfin" => Some(ServerKind::Jellyfin),
            _ => None,
        }
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key identifying one upstream playback instance. Sessions from
/// different servers must never merge, so the server id is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub server_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new<S: Into<String>, T: Into<String>>(server_id: S, session_id: T) -> Self {
        Self {
            server_id: server_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.session_id)
    }
}

/// Per-track and per-session playback classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayMethod {
    DirectPlay,
    Transcode,
}

impl PlayMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayMethod::DirectPlay => "DirectPlay",
            PlayMethod::Transcode => "Transcode",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.trim().to_ascii_lowercase().starts_with("trans") {
            PlayMethod::Transcode
        } else {
            PlayMethod::DirectPlay
        }
    }

    pub fn is_transcode(&self) -> bool {
        matches!(self, PlayMethod::Transcode)
    }
}

impl fmt::Display for PlayMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item types that represent linear/live playback. These never enter the
/// interval ledger.
const LIVE_TV_TYPES: [&str; 4] = ["tvchannel", "livetv", "channel", "tvprogram"];

pub fn is_live_tv_type(item_type: &str) -> bool {
    let t = item_type.trim().to_ascii_lowercase();
    LIVE_TV_TYPES.contains(&t.as_str())
}

/// One currently playing session, normalized across server types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedSession {
    pub server_id: String,
    pub server_kind: ServerKind,
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub item_id: String,
    pub item_name: String,
    pub item_type: String,
    pub series_name: Option<String>,
    pub season_index: Option<i64>,
    pub episode_index: Option<i64>,
    /// Playhead in milliseconds, when the server reports one.
    pub position_ms: Option<i64>,
    /// Item runtime in milliseconds, when known.
    pub duration_ms: Option<i64>,
    pub client_name: String,
    pub device_id: String,
    pub device_name: String,
    pub remote_address: String,
    pub is_paused: bool,
    /// The raw play-method string as the server reported it.
    pub play_method_raw: String,
    pub play_method: PlayMethod,
    pub video_method: PlayMethod,
    pub audio_method: PlayMethod,
    pub video_codec_from: Option<String>,
    pub video_codec_to: Option<String>,
    pub audio_codec_from: Option<String>,
    pub audio_codec_to: Option<String>,
    pub container: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    /// Current stream bitrate in bits per second.
    pub bitrate: Option<i64>,
    pub dolby_vision: bool,
    pub hdr10: bool,
    pub audio_language: Option<String>,
    pub audio_channels: Option<i64>,
    pub subtitle_language: Option<String>,
    pub subtitle_codec: Option<String>,
    pub transcode_reasons: Vec<String>,
    /// Transcoder completion percentage, when transcoding.
    pub transcode_progress: Option<f64>,
    pub transcode_video_bitrate: Option<i64>,
    pub transcode_audio_bitrate: Option<i64>,
    pub last_seen: DateTime<Utc>,
}

impl NormalizedSession {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.server_id.clone(), self.session_id.clone())
    }

    pub fn position_ticks(&self) -> Option<i64> {
        self.position_ms.map(crate::utils::time::ms_to_ticks)
    }

    pub fn progress_pct(&self) -> Option<f64> {
        match (self.position_ms, self.duration_ms) {
            (Some(pos), Some(dur)) if dur > 0 => Some((pos as f64 / dur as f64) * 100.0),
            _ => None,
        }
    }
}

/// A media-server account, upserted by the user sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub server_id: String,
    pub server_type: ServerKind,
    pub display_name: String,
}

/// A library item, upserted by the library sync and referenced by sessions
/// and intervals for enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryItem {
    pub id: String,
    pub server_id: String,
    pub item_type: String,
    pub name: String,
    pub series_id: Option<String>,
    pub series_name: Option<String>,
    pub season_index: Option<i64>,
    pub episode_index: Option<i64>,
    pub runtime_ticks: Option<i64>,
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Option<String>,
    pub file_path: Option<String>,
    pub genres: Option<String>,
}

impl LibraryItem {
    /// Render an item for display. Episodes become
    /// `"{series} - {name} (SxxEyy)"` with progressive fallbacks when the
    /// indices or series name are unknown.
    pub fn display_name(&self) -> String {
        match (&self.series_name, self.season_index, self.episode_index) {
            (Some(series), Some(season), Some(episode)) => {
                format!("{} - {} (S{:02}E{:02})", series, self.name, season, episode)
            }
            (Some(series), _, _) => format!("{} - {}", series, self.name),
            _ => self.name.clone(),
        }
    }
}

/// One row per `(server_id, session_id, item_id)` playback attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaySession {
    pub id: i64,
    pub server_id: String,
    pub session_id: String,
    pub item_id: String,
    pub user_id: String,
    pub device_id: String,
    pub client_name: String,
    pub remote_address: String,
    pub play_method: PlayMethod,
    pub video_method: PlayMethod,
    pub audio_method: PlayMethod,
    pub video_codec_from: Option<String>,
    pub video_codec_to: Option<String>,
    pub audio_codec_from: Option<String>,
    pub audio_codec_to: Option<String>,
    pub transcode_reasons: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub is_active: bool,
}

/// One contiguous segment of actually progressing playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayInterval {
    pub id: i64,
    pub session_fk: i64,
    pub user_id: String,
    pub item_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub start_pos_ticks: i64,
    pub end_pos_ticks: i64,
    pub duration_seconds: i64,
    pub seeked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayEventKind {
    Start,
    Progress,
    Stop,
}

impl PlayEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayEventKind::Start => "start",
            PlayEventKind::Progress => "progress",
            PlayEventKind::Stop => "stop",
        }
    }
}

/// Authoritative watch totals derived from upstream played flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifetimeWatch {
    pub user_id: String,
    pub total_ms: i64,
    pub emby_ms: i64,
    pub trakt_ms: i64,
}

/// Result of an adapter health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub reachable: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Minimal system information reported by an upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub server_name: String,
    pub version: String,
    pub id: String,
}

/// One library item as seen from a user's perspective (watch flags).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDataItem {
    pub item: LibraryItem,
    pub played: bool,
    pub play_count: i64,
    pub last_played: Option<DateTime<Utc>>,
}

/// One entry of a user's recent play history as reported upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub item_id: String,
    pub item_name: String,
    pub played_at: Option<DateTime<Utc>>,
}

/// The broadcast element sent to realtime subscribers and returned by the
/// snapshot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowEntry {
    pub timestamp: i64,
    pub title: String,
    pub user: String,
    pub app: String,
    pub device: String,
    pub play_method: String,
    pub video: String,
    pub audio: String,
    pub subs: String,
    pub bitrate: i64,
    pub progress_pct: f64,
    pub position_sec: i64,
    pub duration_sec: i64,
    pub poster: String,
    pub session_id: String,
    pub item_id: String,
    pub item_type: String,
    pub container: String,
    pub width: i64,
    pub height: i64,
    pub dolby_vision: bool,
    pub hdr10: bool,
    pub audio_lang: String,
    pub audio_ch: i64,
    pub sub_lang: String,
    pub sub_codec: String,
    pub trans_video_from: String,
    pub trans_video_to: String,
    pub trans_audio_from: String,
    pub trans_audio_to: String,
    pub video_method: String,
    pub audio_method: String,
    pub stream_path: String,
    pub stream_detail: String,
    pub trans_reason: String,
    pub trans_pct: f64,
    pub trans_audio_bitrate: i64,
    pub trans_video_bitrate: i64,
    pub is_paused: bool,
    pub server_id: String,
    pub server_type: String,
}

/// Response of the lightweight now-playing summary endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlayingSummary {
    pub outbound_mbps: f64,
    pub active_streams: usize,
    pub active_transcodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_tv_detection_is_case_insensitive_and_trimmed() {
        assert!(is_live_tv_type("TvChannel"));
        assert!(is_live_tv_type("  livetv "));
        assert!(is_live_tv_type("CHANNEL"));
        assert!(is_live_tv_type("TvProgram"));
        assert!(!is_live_tv_type("Movie"));
        assert!(!is_live_tv_type("Episode"));
    }

    #[test]
    fn play_method_parses_transcode_prefix() {
        assert_eq!(PlayMethod::parse("Transcode"), PlayMethod::Transcode);
        assert_eq!(PlayMethod::parse("transcoding"), PlayMethod::Transcode);
        assert_eq!(PlayMethod::parse("DirectPlay"), PlayMethod::DirectPlay);
        assert_eq!(PlayMethod::parse(""), PlayMethod::DirectPlay);
    }

    #[test]
    fn episode_display_falls_back_progressively() {
        let mut item = LibraryItem {
            id: "i1".into(),
            server_id: "s1".into(),
            item_type: "Episode".into(),
            name: "Pilot".into(),
            series_name: Some("Some Show".into()),
            season_index: Some(1),
            episode_index: Some(2),
            ..Default::default()
        };
        assert_eq!(item.display_name(), "Some Show - Pilot (S01E02)");

        item.episode_index = None;
        assert_eq!(item.display_name(), "Some Show - Pilot");

        item.series_name = None;
        assert_eq!(item.display_name(), "Pilot");
    }
}
