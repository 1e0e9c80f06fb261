//! Per-session tracking state.
//!
//! One tracker exists for every live session key. It carries everything
//! the state machine needs to turn the next observation into interval
//! mutations: the playhead and wall clock of the last event, the bounds of
//! the currently open interval, and the row id used to advance that
//! interval in place.

use crate::models::{NormalizedSession, SessionKey};
use crate::utils::time::{ticks_to_seconds, TICKS_PER_SECOND};

#[derive(Debug, Clone)]
pub struct SessionTracker {
    pub session_fk: i64,
    pub key: SessionKey,
    pub user_id: String,
    pub item_id: String,
    pub item_type: String,
    /// Last observed playhead in ticks.
    pub last_position_ticks: i64,
    /// Wall clock of the last observation, unix seconds.
    pub last_event_ts: i64,
    pub session_start_ts: i64,
    pub interval_open: bool,
    pub interval_start_ts: i64,
    pub interval_start_pos_ticks: i64,
    /// Whether any interval row was ever persisted for this session.
    pub had_any_interval: bool,
    /// Row id of the open interval, once it has been persisted.
    pub current_interval_id: Option<i64>,
    pub accumulated_active_seconds: i64,
    pub last_paused: bool,
    /// Wall clock of the last persisted progress audit row.
    pub last_progress_audit_ts: i64,
}

impl SessionTracker {
    pub fn new(session_fk: i64, session: &NormalizedSession, now: i64) -> Self {
        Self {
            session_fk,
            key: session.key(),
            user_id: session.user_id.clone(),
            item_id: session.item_id.clone(),
            item_type: session.item_type.clone(),
            last_position_ticks: session.position_ticks().unwrap_or(0),
            last_event_ts: now,
            session_start_ts: now,
            interval_open: false,
            interval_start_ts: 0,
            interval_start_pos_ticks: 0,
            had_any_interval: false,
            current_interval_id: None,
            accumulated_active_seconds: 0,
            last_paused: session.is_paused,
            last_progress_audit_ts: 0,
        }
    }

    /// Whether a new playhead constitutes a seek: the jump is measured
    /// against where normal playback would have put the playhead since the
    /// last event (frozen while paused). The threshold boundary itself
    /// counts as a seek.
    pub fn is_seek(&self, position_ticks: i64, now: i64, seek_threshold_seconds: u64) -> bool {
        let elapsed_ticks = if self.last_paused {
            0
        } else {
            (now - self.last_event_ts).max(0) * TICKS_PER_SECOND
        };
        let expected = self.last_position_ticks + elapsed_ticks;
        let jump = (position_ticks - expected).abs();
        jump >= seek_threshold_seconds as i64 * TICKS_PER_SECOND
    }

    pub fn open_interval(&mut self, now: i64, position_ticks: i64) {
        self.interval_open = true;
        self.interval_start_ts = now;
        self.interval_start_pos_ticks = position_ticks;
        self.current_interval_id = None;
    }

    pub fn close_interval(&mut self) {
        self.interval_open = false;
        self.current_interval_id = None;
    }

    /// Active seconds contributed since the previous observation,
    /// preferring the playhead delta and falling back to wall clock when
    /// the server did not report a position.
    pub fn active_seconds_since_last(&self, position_ticks: Option<i64>, now: i64) -> i64 {
        match position_ticks {
            Some(pos) if self.last_position_ticks > 0 || pos > 0 => {
                ticks_to_seconds((pos - self.last_position_ticks).abs())
            }
            _ => (now - self.last_event_ts).max(0),
        }
    }

    pub fn touch(&mut self, position_ticks: Option<i64>, now: i64, paused: bool) {
        if let Some(pos) = position_ticks {
            self.last_position_ticks = pos;
        }
        self.last_event_ts = now;
        self.last_paused = paused;
    }
}
