//! Play-method classification.
//!
//! The same rules apply to every server type: subtitle burn-in forces a
//! transcode, a raw play-method string beginning with `trans` forces the
//! session aggregate, and a per-track codec change marks that track. The
//! video and audio methods are independent.

use crate::models::{NormalizedSession, PlayMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub play_method: PlayMethod,
    pub video_method: PlayMethod,
    pub audio_method: PlayMethod,
}

pub fn has_subtitle_or_burn_reason(reasons: &[String]) -> bool {
    reasons.iter().any(|reason| {
        let r = reason.to_ascii_lowercase();
        r.contains("subtitle") || r.contains("burn")
    })
}

fn codecs_differ(from: Option<&str>, to: Option<&str>) -> bool {
    match (from, to) {
        (Some(from), Some(to)) => {
            !from.trim().is_empty()
                && !to.trim().is_empty()
                && !from.trim().eq_ignore_ascii_case(to.trim())
        }
        _ => false,
    }
}

/// Classify one session's tracks and aggregate method.
pub fn classify_methods(
    play_method_raw: &str,
    reasons: &[String],
    video_from: Option<&str>,
    video_to: Option<&str>,
    audio_from: Option<&str>,
    audio_to: Option<&str>,
) -> Classification {
    let burned = has_subtitle_or_burn_reason(reasons);

    let video_method = if burned || codecs_differ(video_from, video_to) {
        PlayMethod::Transcode
    } else {
        PlayMethod::DirectPlay
    };
    let audio_method = if codecs_differ(audio_from, audio_to) {
        PlayMethod::Transcode
    } else {
        PlayMethod::DirectPlay
    };

    let raw_says_transcode = play_method_raw
        .trim()
        .to_ascii_lowercase()
        .starts_with("trans");
    let play_method =
        if raw_says_transcode || video_method.is_transcode() || audio_method.is_transcode() {
            PlayMethod::Transcode
        } else {
            PlayMethod::DirectPlay
        };

    Classification {
        play_method,
        video_method,
        audio_method,
    }
}

/// Whether a session counts toward `active_transcodes` in the now-playing
/// summary. A remux (container change with codec copy) only counts when
/// `count_remux_as_transcode` is set; subtitle burn-in always counts.
pub fn is_encoding_transcode(session: &NormalizedSession, count_remux_as_transcode: bool) -> bool {
    if has_subtitle_or_burn_reason(&session.transcode_reasons) {
        return true;
    }
    let video_reencoded = codecs_differ(
        session.video_codec_from.as_deref(),
        session.video_codec_to.as_deref(),
    );
    let audio_reencoded = codecs_differ(
        session.audio_codec_from.as_deref(),
        session.audio_codec_to.as_deref(),
    );
    if video_reencoded || audio_reencoded {
        return true;
    }
    count_remux_as_transcode && session.play_method.is_transcode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::ServerKind;

    fn base_session() -> NormalizedSession {
        NormalizedSession {
            server_id: "emby".into(),
            server_kind: ServerKind::Emby,
            session_id: "s1".into(),
            user_id: "u1".into(),
            user_name: "Alice".into(),
            item_id: "i1".into(),
            item_name: "Movie".into(),
            item_type: "Movie".into(),
            series_name: None,
            season_index: None,
            episode_index: None,
            position_ms: Some(0),
            duration_ms: None,
            client_name: String::new(),
            device_id: String::new(),
            device_name: String::new(),
            remote_address: String::new(),
            is_paused: false,
            play_method_raw: "Transcode".into(),
            play_method: PlayMethod::Transcode,
            video_method: PlayMethod::DirectPlay,
            audio_method: PlayMethod::DirectPlay,
            video_codec_from: Some("h264".into()),
            video_codec_to: Some("h264".into()),
            audio_codec_from: Some("aac".into()),
            audio_codec_to: Some("aac".into()),
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

    #[test]
    fn codec_change_marks_only_that_track() {
        let c = classify_methods(
            "DirectPlay",
            &[],
            Some("hevc"),
            Some("h264"),
            Some("aac"),
            Some("aac"),
        );
        assert_eq!(c.video_method, PlayMethod::Transcode);
        assert_eq!(c.audio_method, PlayMethod::DirectPlay);
        assert_eq!(c.play_method, PlayMethod::Transcode);
    }

    #[test]
    fn audio_may_transcode_while_video_is_direct() {
        let c = classify_methods(
            "Transcode",
            &[],
            Some("h264"),
            Some("h264"),
            Some("truehd"),
            Some("aac"),
        );
        assert_eq!(c.video_method, PlayMethod::DirectPlay);
        assert_eq!(c.audio_method, PlayMethod::Transcode);
        assert_eq!(c.play_method, PlayMethod::Transcode);
    }

    #[test]
    fn subtitle_burn_in_forces_video_transcode() {
        let c = classify_methods(
            "DirectStream",
            &["SubtitleCodecNotSupported".to_string()],
            Some("h264"),
            Some("h264"),
            None,
            None,
        );
        assert_eq!(c.video_method, PlayMethod::Transcode);
        assert_eq!(c.play_method, PlayMethod::Transcode);
    }

    #[test]
    fn raw_transcode_prefix_is_case_insensitive() {
        let c = classify_methods("transcoding", &[], None, None, None, None);
        assert_eq!(c.play_method, PlayMethod::Transcode);
        // Track methods stay direct without codec evidence.
        assert_eq!(c.video_method, PlayMethod::DirectPlay);
        assert_eq!(c.audio_method, PlayMethod::DirectPlay);
    }

    #[test]
    fn everything_matching_is_direct_play() {
        let c = classify_methods(
            "DirectPlay",
            &[],
            Some("h264"),
            Some("h264"),
            Some("aac"),
            Some("aac"),
        );
        assert_eq!(c.play_method, PlayMethod::DirectPlay);
    }

    /// Decision fixture: a container-only change with codec copy is a
    /// remux, and a remux does not count as a transcode in the summary
    /// unless explicitly configured to.
    #[test]
    fn remux_is_not_a_transcode() {
        let session = base_session();
        assert!(!is_encoding_transcode(&session, false));
        assert!(is_encoding_transcode(&session, true));
    }

    #[test]
    fn burned_subtitles_always_count_as_transcode() {
        let mut session = base_session();
        session.transcode_reasons = vec!["BurnSubtitles".into()];
        assert!(is_encoding_transcode(&session, false));
    }

    #[test]
    fn reencoded_video_counts_as_transcode() {
        let mut session = base_session();
        session.video_codec_to = Some("h265".into());
        assert!(is_encoding_transcode(&session, false));
    }
}
