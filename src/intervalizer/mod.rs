//! The intervalizer state machine.
//!
//! Converts the unified stream of session observations (push events and
//! polled session lists) into play-session and play-interval rows. One
//! tracker per live session key; a single lock serializes event ingress,
//! the silent-stop detector and the no-progress sweeper, and guards the
//! open-interval view the aggregation layer reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IntervalizerConfig;
use crate::database::Database;
use crate::models::{
    is_live_tv_type, NormalizedSession, PlayEventKind, SessionKey,
};
use crate::utils::time::now_ts;

pub mod tracker;

use tracker::SessionTracker;

/// How an observation entered the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    Start,
    Progress,
    Stopped,
}

/// A currently open interval, exposed to the aggregation layer so queries
/// whose window includes "now" see in-flight playback.
#[derive(Debug, Clone)]
pub struct OpenInterval {
    pub session_fk: i64,
    pub user_id: String,
    pub item_id: String,
    pub start_ts: i64,
}

/// Seconds between persisted progress audit rows per session.
const PROGRESS_AUDIT_INTERVAL: i64 = 30;

pub struct Intervalizer {
    db: Database,
    cfg: IntervalizerConfig,
    trackers: Mutex<HashMap<SessionKey, SessionTracker>>,
}

impl Intervalizer {
    pub fn new(db: Database, cfg: IntervalizerConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            cfg,
            trackers: Mutex::new(HashMap::new()),
        })
    }

    /// Feed one push event.
    pub async fn handle_event(&self, kind: ObservationKind, session: &NormalizedSession) {
        self.handle_event_at(kind, session, now_ts()).await;
    }

    pub async fn handle_event_at(
        &self,
        kind: ObservationKind,
        session: &NormalizedSession,
        now: i64,
    ) {
        if is_live_tv_type(&session.item_type) {
            return;
        }
        let mut trackers = self.trackers.lock().await;
        let result = match kind {
            ObservationKind::Start | ObservationKind::Progress => {
                self.observe(&mut trackers, session, now).await
            }
            ObservationKind::Stopped => {
                self.stop_session(&mut trackers, &session.key(), session.position_ticks(), now)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(key = %session.key(), error = %e, "failed to apply observation");
        }
    }

    /// Feed one poll tick's combined active-sessions list. Tracked keys
    /// absent from the union are treated as silently stopped.
    pub async fn process_active_sessions(&self, sessions: &[NormalizedSession]) {
        self.process_active_sessions_at(sessions, now_ts()).await;
    }

    pub async fn process_active_sessions_at(&self, sessions: &[NormalizedSession], now: i64) {
        let mut trackers = self.trackers.lock().await;

        for session in sessions {
            if is_live_tv_type(&session.item_type) {
                continue;
            }
            if let Err(e) = self.observe(&mut trackers, session, now).await {
                warn!(key = %session.key(), error = %e, "failed to apply observation");
            }
        }

        let seen: HashSet<SessionKey> = sessions.iter().map(NormalizedSession::key).collect();
        let gone: Vec<SessionKey> = trackers
            .keys()
            .filter(|key| !seen.contains(key))
            .cloned()
            .collect();
        for key in gone {
            if let Err(e) = self.silent_stop(&mut trackers, &key).await {
                warn!(key = %key, error = %e, "failed to finalize silently stopped session");
            }
        }
    }

    /// Stopped-session detector for push-stream session lists: finalize
    /// every tracked key of `server_id` that is not in the observed set.
    pub async fn retain_server_sessions(&self, server_id: &str, live_session_ids: &HashSet<String>) {
        let mut trackers = self.trackers.lock().await;
        let gone: Vec<SessionKey> = trackers
            .keys()
            .filter(|key| key.server_id == server_id && !live_session_ids.contains(&key.session_id))
            .cloned()
            .collect();
        for key in gone {
            if let Err(e) = self.silent_stop(&mut trackers, &key).await {
                warn!(key = %key, error = %e, "failed to finalize silently stopped session");
            }
        }
    }

    /// Finalize trackers that have not seen an event for the configured
    /// no-progress timeout.
    pub async fn sweep_no_progress(&self) {
        self.sweep_no_progress_at(now_ts()).await;
    }

    pub async fn sweep_no_progress_at(&self, now: i64) {
        let timeout = self.cfg.no_progress_timeout_seconds as i64;
        let mut trackers = self.trackers.lock().await;
        let stale: Vec<SessionKey> = trackers
            .iter()
            .filter(|(_, t)| now - t.last_event_ts >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            info!(key = %key, "no progress within timeout, treating as stopped");
            if let Err(e) = self.silent_stop(&mut trackers, &key).await {
                warn!(key = %key, error = %e, "failed to finalize stale session");
            }
        }
    }

    /// Run the sweeper loop until cancellation.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.cfg.sweep_interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_no_progress().await,
                _ = cancel.cancelled() => {
                    debug!("sweeper stopping");
                    return;
                }
            }
        }
    }

    /// Snapshot of open intervals; entries are copies.
    pub async fn open_intervals(&self) -> Vec<OpenInterval> {
        let trackers = self.trackers.lock().await;
        trackers
            .values()
            .filter(|t| t.interval_open)
            .map(|t| OpenInterval {
                session_fk: t.session_fk,
                user_id: t.user_id.clone(),
                item_id: t.item_id.clone(),
                start_ts: t.interval_start_ts,
            })
            .collect()
    }

    pub async fn tracked_count(&self) -> usize {
        self.trackers.lock().await.len()
    }

    async fn observe(
        &self,
        trackers: &mut HashMap<SessionKey, SessionTracker>,
        session: &NormalizedSession,
        now: i64,
    ) -> anyhow::Result<()> {
        let key = session.key();

        // A different item under the same key means the old playback is
        // over; finalize it before the new session starts.
        let item_changed = trackers
            .get(&key)
            .map(|t| t.item_id != session.item_id)
            .unwrap_or(false);
        if item_changed {
            self.stop_session(trackers, &key, None, now).await?;
        }

        if !trackers.contains_key(&key) {
            let session_fk = self.db.upsert_play_session(session, now).await?;
            let tracker = SessionTracker::new(session_fk, session, now);
            self.db
                .insert_play_event(
                    session_fk,
                    PlayEventKind::Start,
                    session.is_paused,
                    tracker.last_position_ticks,
                    now,
                )
                .await?;
            debug!(key = %key, session_fk, "tracking new session");
            trackers.insert(key.clone(), tracker);
        }

        let tracker = trackers
            .get_mut(&key)
            .ok_or_else(|| anyhow::anyhow!("tracker vanished for {key}"))?;
        self.progress(tracker, session, now).await
    }

    async fn progress(
        &self,
        tracker: &mut SessionTracker,
        session: &NormalizedSession,
        now: i64,
    ) -> anyhow::Result<()> {
        let position = session.position_ticks();

        if session.is_paused {
            if tracker.interval_open {
                let end_pos = position.unwrap_or(tracker.last_position_ticks);
                self.close_open_interval(tracker, now, end_pos, false).await?;
            }
            tracker.touch(position, now, true);
            return Ok(());
        }

        // Seek detection happens against the previous playhead, before the
        // tracker is touched.
        let seeked = position
            .map(|pos| tracker.is_seek(pos, now, self.cfg.seek_threshold_seconds))
            .unwrap_or(false);
        if seeked {
            if tracker.interval_open {
                self.close_open_interval(
                    tracker,
                    tracker.last_event_ts,
                    tracker.last_position_ticks,
                    true,
                )
                .await?;
            }
            // The next non-seek progress opens a fresh interval.
            tracker.touch(position, now, false);
            return Ok(());
        }

        if tracker.interval_open {
            tracker.accumulated_active_seconds += tracker.active_seconds_since_last(position, now);
            let end_pos = position.unwrap_or(tracker.last_position_ticks);
            let duration = now - tracker.interval_start_ts;
            if duration >= 1 {
                match tracker.current_interval_id {
                    Some(id) => self.db.update_interval(id, now, end_pos, false).await?,
                    None => {
                        let id = self
                            .db
                            .insert_interval(
                                tracker.session_fk,
                                &tracker.user_id,
                                &tracker.item_id,
                                tracker.interval_start_ts,
                                now,
                                tracker.interval_start_pos_ticks,
                                end_pos,
                                false,
                            )
                            .await?;
                        tracker.current_interval_id = Some(id);
                        tracker.had_any_interval = true;
                    }
                }
            }
        } else {
            tracker.open_interval(now, position.unwrap_or(tracker.last_position_ticks));
        }

        if now - tracker.last_progress_audit_ts >= PROGRESS_AUDIT_INTERVAL {
            self.db
                .insert_play_event(
                    tracker.session_fk,
                    PlayEventKind::Progress,
                    false,
                    position.unwrap_or(tracker.last_position_ticks),
                    now,
                )
                .await?;
            tracker.last_progress_audit_ts = now;
        }

        tracker.touch(position, now, false);
        Ok(())
    }

    async fn close_open_interval(
        &self,
        tracker: &mut SessionTracker,
        end_ts: i64,
        end_pos_ticks: i64,
        seeked: bool,
    ) -> anyhow::Result<()> {
        let duration = end_ts - tracker.interval_start_ts;
        if duration >= 1 {
            match tracker.current_interval_id {
                Some(id) => {
                    self.db
                        .update_interval(id, end_ts, end_pos_ticks, seeked)
                        .await?;
                }
                None => {
                    self.db
                        .insert_interval(
                            tracker.session_fk,
                            &tracker.user_id,
                            &tracker.item_id,
                            tracker.interval_start_ts,
                            end_ts,
                            tracker.interval_start_pos_ticks,
                            end_pos_ticks,
                            seeked,
                        )
                        .await?;
                    tracker.had_any_interval = true;
                }
            }
        }
        // Sub-second segments are discarded: no row was ever inserted.
        tracker.close_interval();
        Ok(())
    }

    /// Explicit stop at `now`, with the event's position when it carries
    /// one.
    async fn stop_session(
        &self,
        trackers: &mut HashMap<SessionKey, SessionTracker>,
        key: &SessionKey,
        position_ticks: Option<i64>,
        now: i64,
    ) -> anyhow::Result<()> {
        let Some(mut tracker) = trackers.remove(key) else {
            return Ok(());
        };
        let end_pos = position_ticks.unwrap_or(tracker.last_position_ticks);
        self.finalize(&mut tracker, now, end_pos).await
    }

    /// Silent stop: the source disappeared, so the session ends at the
    /// last thing we actually saw.
    async fn silent_stop(
        &self,
        trackers: &mut HashMap<SessionKey, SessionTracker>,
        key: &SessionKey,
    ) -> anyhow::Result<()> {
        let Some(mut tracker) = trackers.remove(key) else {
            return Ok(());
        };
        let end_ts = tracker.last_event_ts;
        let end_pos = tracker.last_position_ticks;
        debug!(key = %key, end_ts, "session disappeared, finalizing");
        self.finalize(&mut tracker, end_ts, end_pos).await
    }

    async fn finalize(
        &self,
        tracker: &mut SessionTracker,
        end_ts: i64,
        end_pos_ticks: i64,
    ) -> anyhow::Result<()> {
        if tracker.interval_open {
            self.close_open_interval(tracker, end_ts, end_pos_ticks, false)
                .await?;
        }

        // A session that progressed but never produced an interval (all
        // observations arrived too sparsely, or only start+stop were seen)
        // still represents real playback; give it one interval covering
        // the session.
        if !tracker.had_any_interval && end_pos_ticks > 0 {
            let duration = end_ts - tracker.session_start_ts;
            if duration >= 1 {
                self.db
                    .insert_interval(
                        tracker.session_fk,
                        &tracker.user_id,
                        &tracker.item_id,
                        tracker.session_start_ts,
                        end_ts,
                        0,
                        end_pos_ticks,
                        false,
                    )
                    .await?;
                tracker.had_any_interval = true;
            }
        }

        self.db.mark_session_stopped(tracker.session_fk, end_ts).await?;
        self.db
            .insert_play_event(
                tracker.session_fk,
                PlayEventKind::Stop,
                false,
                end_pos_ticks,
                end_ts,
            )
            .await?;
        info!(
            key = %tracker.key,
            session_fk = tracker.session_fk,
            active_seconds = tracker.accumulated_active_seconds,
            "session finalized"
        );
        Ok(())
    }
}
