//! Active-sessions poller and realtime broadcaster.
//!
//! One ticker drives the whole observation pipeline: fan out the
//! active-sessions fetch across all enabled servers, merge results (failed
//! servers keep their last-known sessions, marked degraded), hand the
//! union to the intervalizer, then broadcast the rebuilt snapshot to every
//! realtime subscriber. Subscribers hang off a broadcast channel, so a
//! slow client lags and drops frames instead of blocking the tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheStatus, SessionCache};
use crate::config::StatsConfig;
use crate::database::Database;
use crate::intervalizer::Intervalizer;
use crate::models::{NormalizedSession, NowEntry, NowPlayingSummary};
use crate::sources::{classify, SourceManager};

/// Samples kept for the outbound bandwidth moving average.
const SUMMARY_WINDOW: usize = 5;

/// Trailing moving average over the summed bitrate of active sessions.
pub struct SummaryWindow {
    samples: StdMutex<VecDeque<f64>>,
}

impl SummaryWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            samples: StdMutex::new(VecDeque::with_capacity(SUMMARY_WINDOW)),
        })
    }

    pub fn record(&self, total_bps: f64) {
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        if samples.len() == SUMMARY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(total_bps);
    }

    /// Average of the recorded samples in Mbps, rounded to one decimal.
    pub fn average_mbps(&self) -> f64 {
        let Ok(samples) = self.samples.lock() else {
            return 0.0;
        };
        if samples.is_empty() {
            return 0.0;
        }
        let avg_bps: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        (avg_bps / 1_000_000.0 * 10.0).round() / 10.0
    }
}

pub struct Poller {
    manager: Arc<SourceManager>,
    cache: Arc<SessionCache>,
    intervalizer: Arc<Intervalizer>,
    db: Database,
    stats_cfg: StatsConfig,
    poll_interval: Duration,
    snapshot_tx: broadcast::Sender<String>,
    latest_snapshot: RwLock<String>,
    summary: Arc<SummaryWindow>,
}

impl Poller {
    pub fn new(
        manager: Arc<SourceManager>,
        cache: Arc<SessionCache>,
        intervalizer: Arc<Intervalizer>,
        db: Database,
        stats_cfg: StatsConfig,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            manager,
            cache,
            intervalizer,
            db,
            stats_cfg,
            poll_interval,
            snapshot_tx,
            latest_snapshot: RwLock::new("[]".to_string()),
            summary: SummaryWindow::new(),
        })
    }

    /// Subscribe to snapshot broadcasts. Each message is the serialized
    /// JSON array of now-playing entries.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.snapshot_tx.subscribe()
    }

    pub async fn latest_snapshot(&self) -> String {
        self.latest_snapshot.read().await.clone()
    }

    pub fn summary_window(&self) -> Arc<SummaryWindow> {
        self.summary.clone()
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = cancel.cancelled() => {
                    debug!("poller stopping");
                    return;
                }
            }
        }
    }

    /// One tick: fetch, merge, intervalize, broadcast.
    pub async fn poll_once(&self) {
        let outcomes = self.manager.fetch_all_active().await;
        let mut union: Vec<NormalizedSession> = Vec::new();

        for outcome in outcomes {
            match outcome.result {
                Ok(sessions) => {
                    union.extend(sessions.iter().cloned());
                    self.cache
                        .set(
                            &outcome.server_id,
                            outcome.server_kind,
                            sessions,
                            CacheStatus::Fresh,
                        )
                        .await;
                }
                Err(e) => {
                    // Keep last-known sessions so a flapping server does
                    // not look like every viewer stopped at once.
                    self.cache
                        .set_with_error(&outcome.server_id, outcome.server_kind, e.to_string())
                        .await;
                    if let Some(entry) = self.cache.get(&outcome.server_id).await {
                        union.extend(entry.sessions);
                    }
                }
            }
        }

        self.intervalizer.process_active_sessions(&union).await;

        let active_bitrate: i64 = union
            .iter()
            .filter(|s| !s.is_paused)
            .filter_map(|s| s.bitrate)
            .sum();
        self.summary.record(active_bitrate as f64);

        let entries = self.build_entries(&union).await;
        match serde_json::to_string(&entries) {
            Ok(payload) => {
                *self.latest_snapshot.write().await = payload.clone();
                // No receivers is fine; the channel just drops the frame.
                let _ = self.snapshot_tx.send(payload);
            }
            Err(e) => warn!(error = %e, "failed to serialize snapshot"),
        }
    }

    /// Build the broadcast entries for a session list, enriched from the
    /// library store where possible.
    pub async fn build_entries(&self, sessions: &[NormalizedSession]) -> Vec<NowEntry> {
        let mut entries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let item = self.db.get_library_item(&session.item_id).await.ok().flatten();
            entries.push(build_now_entry(session, item.as_ref()));
        }
        entries
    }

    /// Snapshot for the REST endpoint, optionally filtered to one server.
    pub async fn snapshot_for(&self, server_filter: Option<&str>) -> Vec<NowEntry> {
        let sessions = self.cache.all_sessions().await;
        let filtered: Vec<NormalizedSession> = match server_filter {
            Some(filter) if filter != "all" => sessions
                .into_iter()
                .filter(|s| s.server_id == filter || s.server_kind.as_str() == filter)
                .collect(),
            _ => sessions,
        };
        self.build_entries(&filtered).await
    }

    /// The lightweight summary: moving-average outbound bandwidth plus
    /// stream/transcode counts. Paused sessions do not count.
    pub async fn summary(&self) -> NowPlayingSummary {
        let sessions = self.cache.all_sessions().await;
        let active: Vec<&NormalizedSession> = sessions.iter().filter(|s| !s.is_paused).collect();
        let transcodes = active
            .iter()
            .filter(|s| classify::is_encoding_transcode(s, self.stats_cfg.count_remux_as_transcode))
            .count();
        NowPlayingSummary {
            outbound_mbps: self.summary.average_mbps(),
            active_streams: active.len(),
            active_transcodes: transcodes,
        }
    }
}

fn describe_stream(session: &NormalizedSession) -> (String, String) {
    let path = if session.play_method.is_transcode() {
        "Transcode".to_string()
    } else {
        "Direct".to_string()
    };
    let video = match (&session.video_codec_from, &session.video_codec_to) {
        (Some(from), Some(to)) if !from.eq_ignore_ascii_case(to) => format!("{from} \u{2192} {to}"),
        (Some(from), _) => from.clone(),
        _ => String::new(),
    };
    let audio = match (&session.audio_codec_from, &session.audio_codec_to) {
        (Some(from), Some(to)) if !from.eq_ignore_ascii_case(to) => format!("{from} \u{2192} {to}"),
        (Some(from), _) => from.clone(),
        _ => String::new(),
    };
    let detail = match (video.is_empty(), audio.is_empty()) {
        (false, false) => format!("{video} / {audio}"),
        (false, true) => video,
        (true, false) => audio,
        (true, true) => String::new(),
    };
    (path, detail)
}

fn display_title(session: &NormalizedSession) -> String {
    match (&session.series_name, session.season_index, session.episode_index) {
        (Some(series), Some(season), Some(episode)) => format!(
            "{} - {} (S{:02}E{:02})",
            series, session.item_name, season, episode
        ),
        (Some(series), _, _) => format!("{} - {}", series, session.item_name),
        _ => session.item_name.clone(),
    }
}

/// Project one normalized session into the broadcast shape.
pub fn build_now_entry(
    session: &NormalizedSession,
    item: Option<&crate::models::LibraryItem>,
) -> NowEntry {
    let (stream_path, stream_detail) = describe_stream(session);
    let duration_ms = session
        .duration_ms
        .or_else(|| item.and_then(|i| i.runtime_ticks.map(crate::utils::time::ticks_to_ms)));

    NowEntry {
        timestamp: session.last_seen.timestamp(),
        title: display_title(session),
        user: session.user_name.clone(),
        app: session.client_name.clone(),
        device: session.device_name.clone(),
        play_method: session.play_method.as_str().to_string(),
        video: session
            .video_codec_to
            .clone()
            .or_else(|| session.video_codec_from.clone())
            .unwrap_or_default(),
        audio: session
            .audio_codec_to
            .clone()
            .or_else(|| session.audio_codec_from.clone())
            .unwrap_or_default(),
        subs: session.subtitle_codec.clone().unwrap_or_default(),
        bitrate: session.bitrate.unwrap_or(0),
        progress_pct: session.progress_pct().unwrap_or(0.0),
        position_sec: session.position_ms.unwrap_or(0) / 1000,
        duration_sec: duration_ms.unwrap_or(0) / 1000,
        poster: format!("/images/{}/{}/poster", session.server_id, session.item_id),
        session_id: session.session_id.clone(),
        item_id: session.item_id.clone(),
        item_type: session.item_type.clone(),
        container: session.container.clone().unwrap_or_default(),
        width: session.width.unwrap_or(0),
        height: session.height.unwrap_or(0),
        dolby_vision: session.dolby_vision,
        hdr10: session.hdr10,
        audio_lang: session.audio_language.clone().unwrap_or_default(),
        audio_ch: session.audio_channels.unwrap_or(0),
        sub_lang: session.subtitle_language.clone().unwrap_or_default(),
        sub_codec: session.subtitle_codec.clone().unwrap_or_default(),
        trans_video_from: session.video_codec_from.clone().unwrap_or_default(),
        trans_video_to: session.video_codec_to.clone().unwrap_or_default(),
        trans_audio_from: session.audio_codec_from.clone().unwrap_or_default(),
        trans_audio_to: session.audio_codec_to.clone().unwrap_or_default(),
        video_method: session.video_method.as_str().to_string(),
        audio_method: session.audio_method.as_str().to_string(),
        stream_path,
        stream_detail,
        trans_reason: session.transcode_reasons.join(","),
        trans_pct: session.transcode_progress.unwrap_or(0.0),
        trans_audio_bitrate: session.transcode_audio_bitrate.unwrap_or(0),
        trans_video_bitrate: session.transcode_video_bitrate.unwrap_or(0),
        is_paused: session.is_paused,
        server_id: session.server_id.clone(),
        server_type: session.server_kind.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlayMethod, ServerKind};
    use chrono::Utc;

    fn session(bitrate: i64, paused: bool) -> NormalizedSession {
        NormalizedSession {
            server_id: "emby".into(),
            server_kind: ServerKind::Emby,
            session_id: "s1".into(),
            user_id: "u1".into(),
            user_name: "Alice".into(),
            item_id: "i1".into(),
            item_name: "Pilot".into(),
            item_type: "Episode".into(),
            series_name: Some("Some Show".into()),
            season_index: Some(1),
            episode_index: Some(2),
            position_ms: Some(60_000),
            duration_ms: Some(1_800_000),
            client_name: "web".into(),
            device_id: "d1".into(),
            device_name: "Browser".into(),
            remote_address: "10.0.0.2".into(),
            is_paused: paused,
            play_method_raw: "DirectPlay".into(),
            play_method: PlayMethod::DirectPlay,
            video_method: PlayMethod::DirectPlay,
            audio_method: PlayMethod::DirectPlay,
            video_codec_from: Some("hevc".into()),
            video_codec_to: None,
            audio_codec_from: Some("aac".into()),
            audio_codec_to: None,
            container: Some("mkv".into()),
            width: Some(1920),
            height: Some(1080),
            bitrate: Some(bitrate),
            dolby_vision: false,
            hdr10: false,
            audio_language: Some("eng".into()),
            audio_channels: Some(6),
            subtitle_language: None,
            subtitle_codec: None,
            transcode_reasons: vec![],
            transcode_progress: None,
            transcode_video_bitrate: None,
            transcode_audio_bitrate: None,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn summary_window_is_a_trailing_average_of_five() {
        let window = SummaryWindow::new();
        for sample in [
            10_000_000.0,
            20_000_000.0,
            30_000_000.0,
            40_000_000.0,
            50_000_000.0,
            60_000_000.0,
        ] {
            window.record(sample);
        }
        // First sample rolled out: mean of 20..60 Mbps = 40.0.
        assert_eq!(window.average_mbps(), 40.0);
    }

    #[test]
    fn summary_average_rounds_to_one_decimal() {
        let window = SummaryWindow::new();
        window.record(1_230_000.0);
        window.record(1_240_000.0);
        assert_eq!(window.average_mbps(), 1.2);
    }

    #[test]
    fn now_entry_formats_episode_titles() {
        let entry = build_now_entry(&session(8_000_000, false), None);
        assert_eq!(entry.title, "Some Show - Pilot (S01E02)");
        assert_eq!(entry.position_sec, 60);
        assert_eq!(entry.duration_sec, 1800);
        assert!((entry.progress_pct - 3.333).abs() < 0.01);
        assert_eq!(entry.server_type, "emby");
        assert_eq!(entry.stream_path, "Direct");
    }

    #[test]
    fn transcode_detail_shows_codec_pair() {
        let mut s = session(8_000_000, false);
        s.play_method = PlayMethod::Transcode;
        s.video_method = PlayMethod::Transcode;
        s.video_codec_to = Some("h264".into());
        let entry = build_now_entry(&s, None);
        assert_eq!(entry.stream_path, "Transcode");
        assert_eq!(entry.video, "h264");
        assert!(entry.stream_detail.contains("hevc"));
        assert!(entry.stream_detail.contains("h264"));
    }
}
