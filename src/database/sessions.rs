//! Play-session and play-interval persistence.
//!
//! Session upserts are idempotent on `(server_id, session_id, item_id)`.
//! The currently open interval of a session is advanced in place through
//! its row id; closed intervals are immutable.

use anyhow::Result;
use sqlx::Row;
use tracing::info;

use super::{with_busy_retry, Database};
use crate::models::{NormalizedSession, PlayEventKind, PlayInterval, PlaySession};

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> PlaySession {
    let play_method: String = row.get("play_method");
    let video_method: String = row.get("video_method");
    let audio_method: String = row.get("audio_method");
    PlaySession {
        id: row.get("id"),
        server_id: row.get("server_id"),
        session_id: row.get("session_id"),
        item_id: row.get("item_id"),
        user_id: row.get("user_id"),
        device_id: row.get("device_id"),
        client_name: row.get("client_name"),
        remote_address: row.get("remote_address"),
        play_method: crate::models::PlayMethod::parse(&play_method),
        video_method: crate::models::PlayMethod::parse(&video_method),
        audio_method: crate::models::PlayMethod::parse(&audio_method),
        video_codec_from: row.get("video_codec_from"),
        video_codec_to: row.get("video_codec_to"),
        audio_codec_from: row.get("audio_codec_from"),
        audio_codec_to: row.get("audio_codec_to"),
        transcode_reasons: row.get("transcode_reasons"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

fn interval_from_row(row: &sqlx::sqlite::SqliteRow) -> PlayInterval {
    PlayInterval {
        id: row.get("id"),
        session_fk: row.get("session_fk"),
        user_id: row.get("user_id"),
        item_id: row.get("item_id"),
        start_ts: row.get("start_ts"),
        end_ts: row.get("end_ts"),
        start_pos_ticks: row.get("start_pos_ticks"),
        end_pos_ticks: row.get("end_pos_ticks"),
        duration_seconds: row.get("duration_seconds"),
        seeked: row.get::<i64, _>("seeked") != 0,
    }
}

const SESSION_COLUMNS: &str = "id, server_id, session_id, item_id, user_id, device_id, \
     client_name, remote_address, play_method, video_method, audio_method, \
     video_codec_from, video_codec_to, audio_codec_from, audio_codec_to, \
     transcode_reasons, started_at, ended_at, is_active";

const INTERVAL_COLUMNS: &str = "id, session_fk, user_id, item_id, start_ts, end_ts, \
     start_pos_ticks, end_pos_ticks, duration_seconds, seeked";

impl Database {
    /// Create or reactivate the play-session row for this observation and
    /// return its id. Reactivation refreshes identity and playback
    /// classification and clears `ended_at`.
    pub async fn upsert_play_session(&self, session: &NormalizedSession, now: i64) -> Result<i64> {
        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM play_sessions WHERE server_id = ? AND session_id = ? AND item_id = ?",
        )
        .bind(&session.server_id)
        .bind(&session.session_id)
        .bind(&session.item_id)
        .fetch_optional(self.pool())
        .await?;

        let reasons = session.transcode_reasons.join(",");
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        let session = session.clone();

        if let Some(id) = existing {
            with_busy_retry("reactivate play session", || {
                let pool = pool.clone();
                let session = session.clone();
                let reasons = reasons.clone();
                async move {
                    sqlx::query(
                        r#"
                        UPDATE play_sessions SET
                            user_id = ?, device_id = ?, client_name = ?, remote_address = ?,
                            play_method = ?, video_method = ?, audio_method = ?,
                            video_codec_from = ?, video_codec_to = ?,
                            audio_codec_from = ?, audio_codec_to = ?,
                            transcode_reasons = ?, ended_at = NULL, is_active = 1
                        WHERE id = ?
                        "#,
                    )
                    .bind(&session.user_id)
                    .bind(&session.device_id)
                    .bind(&session.client_name)
                    .bind(&session.remote_address)
                    .bind(session.play_method.as_str())
                    .bind(session.video_method.as_str())
                    .bind(session.audio_method.as_str())
                    .bind(&session.video_codec_from)
                    .bind(&session.video_codec_to)
                    .bind(&session.audio_codec_from)
                    .bind(&session.audio_codec_to)
                    .bind(&reasons)
                    .bind(id)
                    .execute(&pool)
                    .await
                    .map(|_| ())
                }
            })
            .await?;
            return Ok(id);
        }

        let id = with_busy_retry("insert play session", || {
            let pool = pool.clone();
            let session = session.clone();
            let reasons = reasons.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO play_sessions (
                        server_id, session_id, item_id, user_id, device_id, client_name,
                        remote_address, play_method, video_method, audio_method,
                        video_codec_from, video_codec_to, audio_codec_from, audio_codec_to,
                        transcode_reasons, started_at, is_active
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .bind(&session.server_id)
                .bind(&session.session_id)
                .bind(&session.item_id)
                .bind(&session.user_id)
                .bind(&session.device_id)
                .bind(&session.client_name)
                .bind(&session.remote_address)
                .bind(session.play_method.as_str())
                .bind(session.video_method.as_str())
                .bind(session.audio_method.as_str())
                .bind(&session.video_codec_from)
                .bind(&session.video_codec_to)
                .bind(&session.audio_codec_from)
                .bind(&session.audio_codec_to)
                .bind(&reasons)
                .bind(now)
                .execute(&pool)
                .await
                .map(|result| result.last_insert_rowid())
            }
        })
        .await?;
        Ok(id)
    }

    pub async fn mark_session_stopped(&self, session_fk: i64, ended_at: i64) -> Result<()> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        with_busy_retry("mark session stopped", || {
            let pool = pool.clone();
            async move {
                sqlx::query("UPDATE play_sessions SET is_active = 0, ended_at = ? WHERE id = ?")
                    .bind(ended_at)
                    .bind(session_fk)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    /// Insert a new interval row and return its id. Duration is derived
    /// from the timestamps; callers discard sub-second segments before
    /// getting here.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_interval(
        &self,
        session_fk: i64,
        user_id: &str,
        item_id: &str,
        start_ts: i64,
        end_ts: i64,
        start_pos_ticks: i64,
        end_pos_ticks: i64,
        seeked: bool,
    ) -> Result<i64> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        let user_id = user_id.to_string();
        let item_id = item_id.to_string();
        let id = with_busy_retry("insert interval", || {
            let pool = pool.clone();
            let user_id = user_id.clone();
            let item_id = item_id.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO play_intervals (
                        session_fk, user_id, item_id, start_ts, end_ts,
                        start_pos_ticks, end_pos_ticks, duration_seconds, seeked
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(session_fk)
                .bind(&user_id)
                .bind(&item_id)
                .bind(start_ts)
                .bind(end_ts)
                .bind(start_pos_ticks)
                .bind(end_pos_ticks)
                .bind(end_ts - start_ts)
                .bind(seeked as i64)
                .execute(&pool)
                .await
                .map(|result| result.last_insert_rowid())
            }
        })
        .await?;
        Ok(id)
    }

    /// Advance the currently open interval of a session in place.
    pub async fn update_interval(
        &self,
        interval_id: i64,
        end_ts: i64,
        end_pos_ticks: i64,
        seeked: bool,
    ) -> Result<()> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        with_busy_retry("advance interval", || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE play_intervals SET
                        end_ts = ?, end_pos_ticks = ?,
                        duration_seconds = ? - start_ts,
                        seeked = CASE WHEN ? THEN 1 ELSE seeked END
                    WHERE id = ?
                    "#,
                )
                .bind(end_ts)
                .bind(end_pos_ticks)
                .bind(end_ts)
                .bind(seeked as i64)
                .bind(interval_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    pub async fn insert_play_event(
        &self,
        session_fk: i64,
        kind: PlayEventKind,
        is_paused: bool,
        position_ticks: i64,
        created_at: i64,
    ) -> Result<()> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        with_busy_retry("insert play event", || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "INSERT INTO play_events (session_fk, kind, is_paused, position_ticks, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(session_fk)
                .bind(kind.as_str())
                .bind(is_paused as i64)
                .bind(position_ticks)
                .bind(created_at)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    /// Close sessions left active by a previous run. Their intervals were
    /// already advanced row-by-row, so the session end is the latest
    /// interval end (falling back to the session start). Records the sweep
    /// in the cleanup audit.
    pub async fn sweep_orphaned_sessions(&self, now: i64) -> Result<u64> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        let affected = with_busy_retry("sweep orphaned sessions", || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE play_sessions SET
                        is_active = 0,
                        ended_at = COALESCE(
                            (SELECT MAX(end_ts) FROM play_intervals WHERE session_fk = play_sessions.id),
                            started_at
                        )
                    WHERE is_active = 1
                    "#,
                )
                .execute(&pool)
                .await
                .map(|result| result.rows_affected())
            }
        })
        .await?;

        if affected > 0 {
            info!(affected, "closed sessions orphaned by a previous run");
        }
        with_busy_retry("record cleanup", || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "INSERT INTO cleanup_audit (ran_at, action, affected_rows, detail) VALUES (?, 'close_orphaned_sessions', ?, NULL)",
                )
                .bind(now)
                .bind(affected as i64)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;
        Ok(affected)
    }

    pub async fn get_play_session(&self, id: i64) -> Result<Option<PlaySession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM play_sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    pub async fn list_sessions_for_key(
        &self,
        server_id: &str,
        session_id: &str,
    ) -> Result<Vec<PlaySession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM play_sessions WHERE server_id = ? AND session_id = ? ORDER BY id"
        ))
        .bind(server_id)
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    pub async fn list_intervals_for_session(&self, session_fk: i64) -> Result<Vec<PlayInterval>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM play_intervals WHERE session_fk = ? ORDER BY start_ts"
        ))
        .bind(session_fk)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(interval_from_row).collect())
    }

    pub async fn list_all_intervals(&self) -> Result<Vec<PlayInterval>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTERVAL_COLUMNS} FROM play_intervals ORDER BY start_ts, id"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(interval_from_row).collect())
    }

    pub async fn count_play_sessions(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM play_sessions")
            .fetch_one(self.pool())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlayMethod, ServerKind};
    use chrono::Utc;

    fn observation(session_id: &str, item_id: &str) -> NormalizedSession {
        NormalizedSession {
            server_id: "emby".into(),
            server_kind: ServerKind::Emby,
            session_id: session_id.into(),
            user_id: "u1".into(),
            user_name: "Alice".into(),
            item_id: item_id.into(),
            item_name: "Movie".into(),
            item_type: "Movie".into(),
            series_name: None,
            season_index: None,
            episode_index: None,
            position_ms: Some(0),
            duration_ms: Some(3_600_000),
            client_name: "web".into(),
            device_id: "d1".into(),
            device_name: "Browser".into(),
            remote_address: "10.0.0.2".into(),
            is_paused: false,
            play_method_raw: "DirectPlay".into(),
            play_method: PlayMethod::DirectPlay,
            video_method: PlayMethod::DirectPlay,
            audio_method: PlayMethod::DirectPlay,
            video_codec_from: None,
            video_codec_to: None,
            audio_codec_from: None,
            audio_codec_to: None,
            container: Some("mkv".into()),
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

    #[tokio::test]
    async fn session_upsert_reactivates_instead_of_duplicating() {
        let db = Database::new_in_memory().await.unwrap();
        let obs = observation("s1", "i1");

        let first = db.upsert_play_session(&obs, 100).await.unwrap();
        db.mark_session_stopped(first, 150).await.unwrap();

        let second = db.upsert_play_session(&obs, 200).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.count_play_sessions().await.unwrap(), 1);

        let session = db.get_play_session(first).await.unwrap().unwrap();
        assert!(session.is_active);
        assert_eq!(session.ended_at, None);
        // started_at is preserved across reactivation.
        assert_eq!(session.started_at, 100);
    }

    #[tokio::test]
    async fn same_key_different_item_is_a_new_row() {
        let db = Database::new_in_memory().await.unwrap();
        let a = db
            .upsert_play_session(&observation("s1", "item-a"), 100)
            .await
            .unwrap();
        let b = db
            .upsert_play_session(&observation("s1", "item-b"), 200)
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(db.count_play_sessions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn interval_advances_in_place_then_closes() {
        let db = Database::new_in_memory().await.unwrap();
        let fk = db
            .upsert_play_session(&observation("s1", "i1"), 100)
            .await
            .unwrap();

        let id = db
            .insert_interval(fk, "u1", "i1", 100, 105, 0, 50_000_000, false)
            .await
            .unwrap();
        db.update_interval(id, 110, 100_000_000, false).await.unwrap();
        db.update_interval(id, 120, 200_000_000, true).await.unwrap();

        let intervals = db.list_intervals_for_session(fk).await.unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].start_ts, 100);
        assert_eq!(intervals[0].end_ts, 120);
        assert_eq!(intervals[0].duration_seconds, 20);
        assert!(intervals[0].seeked);
    }

    #[tokio::test]
    async fn orphan_sweep_closes_active_sessions_at_last_interval_end() {
        let db = Database::new_in_memory().await.unwrap();
        let fk = db
            .upsert_play_session(&observation("s1", "i1"), 100)
            .await
            .unwrap();
        db.insert_interval(fk, "u1", "i1", 100, 160, 0, 600_000_000, false)
            .await
            .unwrap();

        let affected = db.sweep_orphaned_sessions(500).await.unwrap();
        assert_eq!(affected, 1);

        let session = db.get_play_session(fk).await.unwrap().unwrap();
        assert!(!session.is_active);
        assert_eq!(session.ended_at, Some(160));

        // Nothing left to sweep on the second pass.
        assert_eq!(db.sweep_orphaned_sessions(600).await.unwrap(), 0);
    }
}
