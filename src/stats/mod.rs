//! Interval-based aggregation queries.
//!
//! Watch time for a window `[w0, w1)` is the sum over overlapping
//! intervals of `min(end, w1) - max(start, w0)`. Queries whose window
//! reaches "now" also fold in the currently open in-memory intervals, so
//! a three-hour movie in progress counts before its first interval row is
//! closed.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::StatsConfig;
use crate::database::Database;
use crate::intervalizer::Intervalizer;
use crate::models::LibraryItem;
use crate::sources::SourceManager;
use crate::utils::time::window_overlap_seconds;

const LIVE_TV_FILTER: &str =
    "(li.item_type IS NULL OR LOWER(TRIM(li.item_type)) NOT IN ('tvchannel','livetv','channel','tvprogram'))";

#[derive(Debug, Clone, Serialize)]
pub struct TopUser {
    pub user_id: String,
    pub name: String,
    pub hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopItem {
    pub item_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub hours: f64,
    pub display: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageBucket {
    pub day: String,
    pub hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDetail {
    pub user_id: String,
    pub name: String,
    pub hours: f64,
    pub items: Vec<TopItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifetimeTopUser {
    pub user_id: String,
    pub name: String,
    pub hours: f64,
    pub emby_hours: f64,
    pub trakt_hours: f64,
}

pub struct StatsService {
    db: Database,
    intervalizer: Arc<Intervalizer>,
    manager: Arc<SourceManager>,
    cfg: StatsConfig,
}

fn seconds_to_hours(seconds: i64) -> f64 {
    seconds as f64 / 3600.0
}

impl StatsService {
    pub fn new(
        db: Database,
        intervalizer: Arc<Intervalizer>,
        manager: Arc<SourceManager>,
        cfg: StatsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            intervalizer,
            manager,
            cfg,
        })
    }

    /// Overlay currently open intervals onto per-key second totals when
    /// the window includes "now".
    async fn overlay_open<F>(&self, totals: &mut HashMap<String, i64>, w0: i64, w1: i64, now: i64, key_of: F)
    where
        F: Fn(&crate::intervalizer::OpenInterval) -> String,
    {
        if w1 < now {
            return;
        }
        for open in self.intervalizer.open_intervals().await {
            let seconds = window_overlap_seconds(open.start_ts, now, w0, w1);
            if seconds > 0 {
                *totals.entry(key_of(&open)).or_insert(0) += seconds;
            }
        }
    }

    pub async fn top_users(&self, w0: i64, w1: i64, now: i64, limit: usize) -> Result<Vec<TopUser>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT pi.user_id,
                   SUM(MIN(pi.end_ts, ?) - MAX(pi.start_ts, ?)) AS watch_seconds
            FROM play_intervals pi
            LEFT JOIN library_items li ON li.id = pi.item_id
            WHERE pi.start_ts < ? AND pi.end_ts > ? AND {LIVE_TV_FILTER}
            GROUP BY pi.user_id
            "#
        ))
        .bind(w1)
        .bind(w0)
        .bind(w1)
        .bind(w0)
        .fetch_all(self.db.pool())
        .await?;

        let mut totals: HashMap<String, i64> = rows
            .iter()
            .map(|row| (row.get::<String, _>("user_id"), row.get::<i64, _>("watch_seconds")))
            .collect();
        self.overlay_open(&mut totals, w0, w1, now, |open| open.user_id.clone())
            .await;

        let mut users = Vec::with_capacity(totals.len());
        for (user_id, seconds) in totals {
            let name = self
                .db
                .get_user_display_name(&user_id)
                .await?
                .unwrap_or_else(|| user_id.clone());
            users.push(TopUser {
                user_id,
                name,
                hours: seconds_to_hours(seconds),
            });
        }
        users.sort_by(|a, b| b.hours.total_cmp(&a.hours));
        users.truncate(limit);
        Ok(users)
    }

    pub async fn top_items(&self, w0: i64, w1: i64, now: i64, limit: usize) -> Result<Vec<TopItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT pi.item_id,
                   MAX(ps.server_id) AS server_id,
                   SUM(MIN(pi.end_ts, ?) - MAX(pi.start_ts, ?)) AS watch_seconds
            FROM play_intervals pi
            JOIN play_sessions ps ON ps.id = pi.session_fk
            LEFT JOIN library_items li ON li.id = pi.item_id
            WHERE pi.start_ts < ? AND pi.end_ts > ? AND {LIVE_TV_FILTER}
            GROUP BY pi.item_id
            "#
        ))
        .bind(w1)
        .bind(w0)
        .bind(w1)
        .bind(w0)
        .fetch_all(self.db.pool())
        .await?;

        let mut totals: HashMap<String, i64> = HashMap::new();
        let mut server_of: HashMap<String, String> = HashMap::new();
        for row in &rows {
            let item_id: String = row.get("item_id");
            server_of.insert(item_id.clone(), row.get("server_id"));
            totals.insert(item_id, row.get("watch_seconds"));
        }
        self.overlay_open(&mut totals, w0, w1, now, |open| open.item_id.clone())
            .await;

        let mut items = Vec::with_capacity(totals.len());
        for (item_id, seconds) in totals {
            let item = self
                .resolve_item(&item_id, server_of.get(&item_id).map(String::as_str))
                .await;
            let (name, item_type, display) = match item {
                Some(item) => (item.name.clone(), item.item_type.clone(), item.display_name()),
                None => (item_id.clone(), String::new(), item_id.clone()),
            };
            items.push(TopItem {
                item_id,
                name,
                item_type,
                hours: seconds_to_hours(seconds),
                display,
            });
        }
        items.sort_by(|a, b| b.hours.total_cmp(&a.hours));
        items.truncate(limit);
        Ok(items)
    }

    /// Per-day watch-hour buckets across the window.
    pub async fn usage_histogram(&self, w0: i64, w1: i64, now: i64) -> Result<Vec<UsageBucket>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT pi.start_ts, pi.end_ts
            FROM play_intervals pi
            LEFT JOIN library_items li ON li.id = pi.item_id
            WHERE pi.start_ts < ? AND pi.end_ts > ? AND {LIVE_TV_FILTER}
            "#
        ))
        .bind(w1)
        .bind(w0)
        .fetch_all(self.db.pool())
        .await?;

        let mut spans: Vec<(i64, i64)> = rows
            .iter()
            .map(|row| (row.get::<i64, _>("start_ts"), row.get::<i64, _>("end_ts")))
            .collect();
        if w1 >= now {
            for open in self.intervalizer.open_intervals().await {
                spans.push((open.start_ts, now));
            }
        }

        let mut buckets: HashMap<i64, i64> = HashMap::new();
        for (start, end) in spans {
            let start = start.max(w0);
            let end = end.min(w1);
            let mut cursor = start;
            while cursor < end {
                let day_start = cursor - cursor.rem_euclid(86_400);
                let day_end = day_start + 86_400;
                let seconds = end.min(day_end) - cursor;
                *buckets.entry(day_start).or_insert(0) += seconds;
                cursor = day_end;
            }
        }

        let mut usage: Vec<UsageBucket> = buckets
            .into_iter()
            .map(|(day_start, seconds)| UsageBucket {
                day: crate::utils::time::to_datetime(day_start)
                    .format("%Y-%m-%d")
                    .to_string(),
                hours: seconds_to_hours(seconds),
            })
            .collect();
        usage.sort_by(|a, b| a.day.cmp(&b.day));
        Ok(usage)
    }

    pub async fn user_detail(
        &self,
        user_id: &str,
        w0: i64,
        w1: i64,
        now: i64,
    ) -> Result<UserDetail> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT pi.item_id,
                   MAX(ps.server_id) AS server_id,
                   SUM(MIN(pi.end_ts, ?) - MAX(pi.start_ts, ?)) AS watch_seconds
            FROM play_intervals pi
            JOIN play_sessions ps ON ps.id = pi.session_fk
            LEFT JOIN library_items li ON li.id = pi.item_id
            WHERE pi.user_id = ? AND pi.start_ts < ? AND pi.end_ts > ? AND {LIVE_TV_FILTER}
            GROUP BY pi.item_id
            "#
        ))
        .bind(w1)
        .bind(w0)
        .bind(user_id)
        .bind(w1)
        .bind(w0)
        .fetch_all(self.db.pool())
        .await?;

        let mut totals: HashMap<String, i64> = HashMap::new();
        let mut server_of: HashMap<String, String> = HashMap::new();
        for row in &rows {
            let item_id: String = row.get("item_id");
            server_of.insert(item_id.clone(), row.get("server_id"));
            totals.insert(item_id, row.get("watch_seconds"));
        }
        if w1 >= now {
            for open in self.intervalizer.open_intervals().await {
                if open.user_id != user_id {
                    continue;
                }
                let seconds = window_overlap_seconds(open.start_ts, now, w0, w1);
                if seconds > 0 {
                    *totals.entry(open.item_id.clone()).or_insert(0) += seconds;
                }
            }
        }

        let mut items = Vec::with_capacity(totals.len());
        let mut total_seconds = 0i64;
        for (item_id, seconds) in totals {
            total_seconds += seconds;
            let item = self
                .resolve_item(&item_id, server_of.get(&item_id).map(String::as_str))
                .await;
            let (name, item_type, display) = match item {
                Some(item) => (item.name.clone(), item.item_type.clone(), item.display_name()),
                None => (item_id.clone(), String::new(), item_id.clone()),
            };
            items.push(TopItem {
                item_id,
                name,
                item_type,
                hours: seconds_to_hours(seconds),
                display,
            });
        }
        items.sort_by(|a, b| b.hours.total_cmp(&a.hours));

        Ok(UserDetail {
            name: self
                .db
                .get_user_display_name(user_id)
                .await?
                .unwrap_or_else(|| user_id.to_string()),
            user_id: user_id.to_string(),
            hours: seconds_to_hours(total_seconds),
            items,
        })
    }

    /// The "accurate" top-users feed, read from upstream played-flag
    /// totals instead of intervals. The configured inclusion policy
    /// decides whether Trakt counters contribute.
    pub async fn lifetime_top_users(&self, limit: i64) -> Result<Vec<LifetimeTopUser>> {
        let rows = self.db.top_lifetime_watch(limit).await?;
        let ms_to_hours = |ms: i64| ms as f64 / 3_600_000.0;
        Ok(rows
            .into_iter()
            .map(|(watch, name)| {
                let total_ms = if self.cfg.include_trakt {
                    watch.emby_ms + watch.trakt_ms
                } else {
                    watch.emby_ms
                };
                LifetimeTopUser {
                    user_id: watch.user_id,
                    name,
                    hours: ms_to_hours(total_ms),
                    emby_hours: ms_to_hours(watch.emby_ms),
                    trakt_hours: ms_to_hours(watch.trakt_ms),
                }
            })
            .collect())
    }

    /// Resolve an item for display: local store first, then a best-effort
    /// lookup against the originating server whose result is upserted.
    async fn resolve_item(&self, item_id: &str, server_id: Option<&str>) -> Option<LibraryItem> {
        if let Ok(Some(item)) = self.db.get_library_item(item_id).await {
            return Some(item);
        }
        let server_id = server_id?;
        let client = self.manager.client(server_id).ok()?;
        match client.items_by_ids(&[item_id.to_string()]).await {
            Ok(items) => {
                let item = items.into_iter().next()?;
                let _ = self
                    .db
                    .upsert_library_item(&item, crate::utils::time::now_ts())
                    .await;
                Some(item)
            }
            Err(e) => {
                debug!(item_id, server_id, error = %e, "upstream item lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntervalizerConfig;
    use crate::models::{NormalizedSession, PlayMethod, ServerKind};
    use chrono::Utc;

    fn observation(user_id: &str, item_id: &str, position_ms: i64, paused: bool) -> NormalizedSession {
        NormalizedSession {
            server_id: "emby".into(),
            server_kind: ServerKind::Emby,
            session_id: format!("sess-{user_id}-{item_id}"),
            user_id: user_id.into(),
            user_name: user_id.to_ascii_uppercase(),
            item_id: item_id.into(),
            item_name: item_id.into(),
            item_type: "Movie".into(),
            series_name: None,
            season_index: None,
            episode_index: None,
            position_ms: Some(position_ms),
            duration_ms: Some(7_200_000),
            client_name: String::new(),
            device_id: String::new(),
            device_name: String::new(),
            remote_address: String::new(),
            is_paused: paused,
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
    }

    async fn service() -> (Arc<StatsService>, Database, Arc<Intervalizer>) {
        let db = Database::new_in_memory().await.unwrap();
        let intervalizer = Intervalizer::new(db.clone(), IntervalizerConfig::default());
        let manager = Arc::new(SourceManager::new(Vec::new()));
        let stats = StatsService::new(
            db.clone(),
            intervalizer.clone(),
            manager,
            StatsConfig::default(),
        );
        (stats, db, intervalizer)
    }

    #[tokio::test]
    async fn top_users_sums_window_overlap() {
        let (stats, db, _intervalizer) = service().await;

        let fk = db
            .upsert_play_session(&observation("u1", "i1", 0, false), 1_000)
            .await
            .unwrap();
        // 1000..2000 fully inside, 2500..3500 half clipped by w1=3000.
        db.insert_interval(fk, "u1", "i1", 1_000, 2_000, 0, 0, false)
            .await
            .unwrap();
        db.insert_interval(fk, "u1", "i1", 2_500, 3_500, 0, 0, false)
            .await
            .unwrap();

        let fk2 = db
            .upsert_play_session(&observation("u2", "i1", 0, false), 1_000)
            .await
            .unwrap();
        db.insert_interval(fk2, "u2", "i1", 0, 900, 0, 0, false)
            .await
            .unwrap();

        // Window [1000, 3000), far in the past relative to now.
        let top = stats.top_users(1_000, 3_000, 1_000_000, 10).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].user_id, "u1");
        let expected_hours = 1_500.0 / 3600.0;
        assert!((top[0].hours - expected_hours).abs() < 1e-9);
    }

    #[tokio::test]
    async fn open_intervals_contribute_when_window_reaches_now() {
        let (stats, _db, intervalizer) = service().await;

        let now = 10_000;
        // Opened at t=9_000 and still running at now=10_000.
        intervalizer
            .process_active_sessions_at(&[observation("u1", "i1", 0, false)], 9_000)
            .await;

        let top = stats.top_users(0, now, now, 10).await.unwrap();
        assert_eq!(top.len(), 1);
        let expected_hours = 1_000.0 / 3600.0;
        assert!((top[0].hours - expected_hours).abs() < 1e-6);

        // A window that ended before now sees nothing from the open
        // interval (it started after the window closed).
        let past = stats.top_users(0, 5_000, now, 10).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn usage_histogram_splits_across_days() {
        let (stats, db, _intervalizer) = service().await;
        let fk = db
            .upsert_play_session(&observation("u1", "i1", 0, false), 0)
            .await
            .unwrap();
        // 2h straddling a midnight boundary: 1h on each side.
        let midnight = 86_400 * 100;
        db.insert_interval(fk, "u1", "i1", midnight - 3_600, midnight + 3_600, 0, 0, false)
            .await
            .unwrap();

        let usage = stats
            .usage_histogram(midnight - 86_400, midnight + 86_400, i64::MAX - 1)
            .await
            .unwrap();
        assert_eq!(usage.len(), 2);
        assert!((usage[0].hours - 1.0).abs() < 1e-9);
        assert!((usage[1].hours - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn lifetime_totals_follow_trakt_inclusion_flag() {
        let db = Database::new_in_memory().await.unwrap();
        let intervalizer = Intervalizer::new(db.clone(), IntervalizerConfig::default());
        let manager = Arc::new(SourceManager::new(Vec::new()));
        db.upsert_lifetime_watch(
            &crate::models::LifetimeWatch {
                user_id: "u1".into(),
                total_ms: 0,
                emby_ms: 3_600_000,
                trakt_ms: 7_200_000,
            },
            100,
        )
        .await
        .unwrap();

        let with_trakt = StatsService::new(
            db.clone(),
            intervalizer.clone(),
            manager.clone(),
            StatsConfig {
                include_trakt: true,
                ..Default::default()
            },
        );
        let top = with_trakt.lifetime_top_users(10).await.unwrap();
        assert!((top[0].hours - 3.0).abs() < 1e-9);

        let without_trakt = StatsService::new(
            db,
            intervalizer,
            manager,
            StatsConfig {
                include_trakt: false,
                ..Default::default()
            },
        );
        let top = without_trakt.lifetime_top_users(10).await.unwrap();
        assert!((top[0].hours - 1.0).abs() < 1e-9);
    }
}
