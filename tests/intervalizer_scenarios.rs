//! End-to-end scenarios for the intervalization state machine: observation
//! streams in, session and interval rows out.

use chrono::Utc;
use playtally::config::IntervalizerConfig;
use playtally::database::Database;
use playtally::intervalizer::{Intervalizer, ObservationKind};
use playtally::models::{NormalizedSession, PlayMethod, ServerKind};
use std::sync::Arc;

const T0: i64 = 1_700_000_000;

fn observation(session_id: &str, item_id: &str, position_ms: i64, paused: bool) -> NormalizedSession {
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
        position_ms: Some(position_ms),
        duration_ms: Some(7_200_000),
        client_name: "web".into(),
        device_id: "d1".into(),
        device_name: "Browser".into(),
        remote_address: "10.0.0.2".into(),
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

fn live_tv(session_id: &str, position_ms: i64) -> NormalizedSession {
    let mut s = observation(session_id, "channel4", position_ms, false);
    s.item_type = "TvChannel".into();
    s
}

async fn engine_with(threshold: u64) -> (Database, Arc<Intervalizer>) {
    let db = Database::new_in_memory().await.unwrap();
    let cfg = IntervalizerConfig {
        seek_threshold_seconds: threshold,
        ..Default::default()
    };
    let intervalizer = Intervalizer::new(db.clone(), cfg);
    (db, intervalizer)
}

#[tokio::test]
async fn direct_play_to_completion() {
    let (db, iv) = engine_with(5).await;

    iv.handle_event_at(ObservationKind::Start, &observation("s1", "i1", 0, false), T0)
        .await;
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 10_000, false),
        T0 + 10,
    )
    .await;
    iv.handle_event_at(
        ObservationKind::Stopped,
        &observation("s1", "i1", 20_000, false),
        T0 + 20,
    )
    .await;

    assert_eq!(db.count_play_sessions().await.unwrap(), 1);
    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    assert!(!sessions[0].is_active);
    assert_eq!(sessions[0].ended_at, Some(T0 + 20));

    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].start_ts, T0);
    assert_eq!(intervals[0].end_ts, T0 + 20);
    assert_eq!(intervals[0].duration_seconds, 20);
    assert!(!intervals[0].seeked);
}

#[tokio::test]
async fn pause_in_the_middle_yields_two_intervals() {
    let (db, iv) = engine_with(5).await;

    for (dt, pos, paused) in [
        (0, 0, false),
        (5, 5_000, false),
        (7, 5_000, true),
        (15, 5_000, false),
    ] {
        iv.handle_event_at(
            ObservationKind::Progress,
            &observation("s1", "i1", pos, paused),
            T0 + dt,
        )
        .await;
    }
    iv.handle_event_at(
        ObservationKind::Stopped,
        &observation("s1", "i1", 10_000, false),
        T0 + 20,
    )
    .await;

    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!((intervals[0].start_ts, intervals[0].end_ts), (T0, T0 + 7));
    assert_eq!(intervals[0].duration_seconds, 7);
    assert_eq!(
        (intervals[1].start_ts, intervals[1].end_ts),
        (T0 + 15, T0 + 20)
    );
    assert_eq!(intervals[1].duration_seconds, 5);
    // Total active time across intervals: 12 seconds.
    let total: i64 = intervals.iter().map(|i| i.duration_seconds).sum();
    assert_eq!(total, 12);
}

#[tokio::test]
async fn seek_closes_interval_at_last_position() {
    let (db, iv) = engine_with(3).await;

    iv.handle_event_at(ObservationKind::Start, &observation("s1", "i1", 0, false), T0)
        .await;
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 10_000, false),
        T0 + 10,
    )
    .await;
    // One second later the playhead is at ten minutes: a seek.
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 600_000, false),
        T0 + 11,
    )
    .await;

    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!((intervals[0].start_ts, intervals[0].end_ts), (T0, T0 + 10));
    assert!(intervals[0].seeked);
    assert_eq!(intervals[0].end_pos_ticks, 10_000 * 10_000);

    // The next non-seek progress opens a fresh interval.
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 605_000, false),
        T0 + 16,
    )
    .await;
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 610_000, false),
        T0 + 21,
    )
    .await;
    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[1].start_ts, T0 + 16);
    assert!(!intervals[1].seeked);
}

#[tokio::test]
async fn silent_stop_when_key_leaves_the_poll_union() {
    let (db, iv) = engine_with(5).await;

    for tick in 0..3i64 {
        iv.process_active_sessions_at(
            &[observation("s1", "i1", tick * 5_000, false)],
            T0 + tick * 5,
        )
        .await;
    }
    // Tick 4: the key is gone and no stop event ever arrives.
    iv.process_active_sessions_at(&[], T0 + 15).await;

    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(!sessions[0].is_active);
    // Finalized at the last observation, not at the tick that noticed.
    assert_eq!(sessions[0].ended_at, Some(T0 + 10));

    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].end_ts, T0 + 10);
    assert_eq!(iv.tracked_count().await, 0);
}

#[tokio::test]
async fn live_tv_produces_no_rows() {
    let (db, iv) = engine_with(5).await;

    for tick in 0..12i64 {
        iv.process_active_sessions_at(&[live_tv("s9", tick * 5_000)], T0 + tick * 5)
            .await;
    }
    iv.handle_event_at(ObservationKind::Stopped, &live_tv("s9", 60_000), T0 + 60)
        .await;

    assert_eq!(db.count_play_sessions().await.unwrap(), 0);
    assert!(db.list_all_intervals().await.unwrap().is_empty());
    assert_eq!(iv.tracked_count().await, 0);
}

#[tokio::test]
async fn session_key_reuse_finalizes_prior_item() {
    let (db, iv) = engine_with(5).await;

    iv.process_active_sessions_at(&[observation("s1", "item-a", 0, false)], T0)
        .await;
    iv.process_active_sessions_at(&[observation("s1", "item-a", 10_000, false)], T0 + 10)
        .await;
    // Same key, new item.
    iv.process_active_sessions_at(&[observation("s1", "item-b", 0, false)], T0 + 30)
        .await;

    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    assert_eq!(sessions.len(), 2);

    let a = sessions.iter().find(|s| s.item_id == "item-a").unwrap();
    let b = sessions.iter().find(|s| s.item_id == "item-b").unwrap();
    assert!(!a.is_active);
    assert_eq!(a.ended_at, Some(T0 + 30));
    assert!(b.is_active);
    assert_eq!(b.started_at, T0 + 30);

    // No interval spans both sessions.
    for interval in db.list_intervals_for_session(a.id).await.unwrap() {
        assert_eq!(interval.item_id, "item-a");
        assert!(interval.end_ts <= T0 + 30);
    }
    for interval in db.list_intervals_for_session(b.id).await.unwrap() {
        assert_eq!(interval.item_id, "item-b");
        assert!(interval.start_ts >= T0 + 30);
    }
}

#[tokio::test]
async fn stop_without_intervals_synthesizes_one_from_session_start() {
    let (db, iv) = engine_with(5).await;

    // Only a start and a stop are ever observed, but the playhead moved.
    iv.handle_event_at(ObservationKind::Start, &observation("s1", "i1", 0, true), T0)
        .await;
    iv.handle_event_at(
        ObservationKind::Stopped,
        &observation("s1", "i1", 30_000, false),
        T0 + 30,
    )
    .await;

    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!((intervals[0].start_ts, intervals[0].end_ts), (T0, T0 + 30));
    assert_eq!(intervals[0].start_pos_ticks, 0);
    assert_eq!(intervals[0].end_pos_ticks, 30_000 * 10_000);
}

#[tokio::test]
async fn sub_second_segments_are_discarded() {
    let (db, iv) = engine_with(5).await;

    // Open and pause within the same second.
    iv.handle_event_at(ObservationKind::Start, &observation("s1", "i1", 0, false), T0)
        .await;
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 500, true),
        T0,
    )
    .await;

    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    assert!(db
        .list_intervals_for_session(sessions[0].id)
        .await
        .unwrap()
        .is_empty());

    // A one-second segment is kept.
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 500, false),
        T0 + 2,
    )
    .await;
    iv.handle_event_at(
        ObservationKind::Progress,
        &observation("s1", "i1", 1_500, true),
        T0 + 3,
    )
    .await;
    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].duration_seconds, 1);
}

#[tokio::test]
async fn no_progress_sweep_fires_after_timeout() {
    let db = Database::new_in_memory().await.unwrap();
    let cfg = IntervalizerConfig {
        seek_threshold_seconds: 5,
        no_progress_timeout_seconds: 90,
        sweep_interval_seconds: 30,
    };
    let iv = Intervalizer::new(db.clone(), cfg);

    iv.process_active_sessions_at(&[observation("s1", "i1", 0, false)], T0)
        .await;

    // Just inside the timeout: still tracked.
    iv.sweep_no_progress_at(T0 + 89).await;
    assert_eq!(iv.tracked_count().await, 1);

    // At the timeout boundary the session is finalized.
    iv.sweep_no_progress_at(T0 + 90).await;
    assert_eq!(iv.tracked_count().await, 0);

    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    assert!(!sessions[0].is_active);
    assert_eq!(sessions[0].ended_at, Some(T0));
}

#[tokio::test]
async fn reactivating_a_dormant_session_reuses_the_row() {
    let (db, iv) = engine_with(5).await;

    iv.process_active_sessions_at(&[observation("s1", "i1", 0, false)], T0)
        .await;
    iv.process_active_sessions_at(&[observation("s1", "i1", 5_000, false)], T0 + 5)
        .await;
    iv.process_active_sessions_at(&[], T0 + 10).await;
    assert_eq!(db.count_play_sessions().await.unwrap(), 1);

    // The same (server, session, item) triple comes back an hour later.
    iv.process_active_sessions_at(&[observation("s1", "i1", 5_000, false)], T0 + 3_600)
        .await;
    iv.process_active_sessions_at(&[observation("s1", "i1", 10_000, false)], T0 + 3_605)
        .await;

    assert_eq!(db.count_play_sessions().await.unwrap(), 1);
    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    assert!(sessions[0].is_active);
    assert_eq!(sessions[0].ended_at, None);

    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 2);
}

#[tokio::test]
async fn contiguous_segments_map_to_interval_rows() {
    let (db, iv) = engine_with(5).await;

    // Three active segments separated by two pauses.
    let script: &[(i64, i64, bool)] = &[
        (0, 0, false),
        (10, 10_000, false),
        (12, 10_000, true),
        (20, 10_000, false),
        (30, 20_000, false),
        (32, 20_000, true),
        (40, 20_000, false),
        (50, 30_000, false),
    ];
    for (dt, pos, paused) in script {
        iv.process_active_sessions_at(&[observation("s1", "i1", *pos, *paused)], T0 + dt)
            .await;
    }
    iv.handle_event_at(
        ObservationKind::Stopped,
        &observation("s1", "i1", 35_000, false),
        T0 + 55,
    )
    .await;

    assert_eq!(db.count_play_sessions().await.unwrap(), 1);
    let sessions = db.list_sessions_for_key("emby", "s1").await.unwrap();
    let intervals = db.list_intervals_for_session(sessions[0].id).await.unwrap();
    assert_eq!(intervals.len(), 3);

    // Non-overlapping and ordered.
    for pair in intervals.windows(2) {
        assert!(pair[0].end_ts <= pair[1].start_ts);
    }
}
