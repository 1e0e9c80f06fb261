//! Time and position unit helpers.
//!
//! Upstream servers disagree about units: Emby and Jellyfin report
//! positions in 100ns ticks, Plex reports milliseconds. Internally all
//! positions are normalized to ticks and all timestamps to unix seconds.

use chrono::{DateTime, Duration, Utc};

/// Number of 100ns ticks per millisecond.
pub const TICKS_PER_MS: i64 = 10_000;

/// Number of 100ns ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

pub fn ms_to_ticks(ms: i64) -> i64 {
    ms.saturating_mul(TICKS_PER_MS)
}

pub fn ticks_to_ms(ticks: i64) -> i64 {
    ticks / TICKS_PER_MS
}

pub fn ticks_to_seconds(ticks: i64) -> i64 {
    ticks / TICKS_PER_SECOND
}

/// Current wall clock as unix seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Parse a stats window expression (`24h`, `7d`, `30d`, `all`) into a
/// `[start, end)` pair of unix seconds ending at `now`. Unknown or missing
/// expressions default to the last 7 days.
pub fn parse_window(expr: Option<&str>, now: i64) -> (i64, i64) {
    let expr = expr.unwrap_or("7d").trim().to_ascii_lowercase();
    if expr == "all" {
        return (0, now);
    }
    let (digits, unit) = expr.split_at(expr.len().saturating_sub(1));
    let amount: i64 = digits.parse().unwrap_or(7);
    let span = match unit {
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        _ => Duration::days(7),
    };
    (now - span.num_seconds(), now)
}

/// Overlap in seconds between `[start, end)` and the window `[w0, w1)`.
/// Zero when the ranges do not intersect.
pub fn window_overlap_seconds(start: i64, end: i64, w0: i64, w1: i64) -> i64 {
    let overlap = end.min(w1) - start.max(w0);
    overlap.max(0)
}

pub fn to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}
