//! Short-TTL cache of last-known sessions per server.
//!
//! The cache is ephemeral working state for the poller and the snapshot
//! endpoints; it is never persisted and is not a source of truth. Entries
//! survive refresh failures so a flapping server degrades to stale data
//! instead of an empty screen.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::models::{NormalizedSession, ServerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStatus {
    Fresh,
    Stale,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub sessions: Vec<NormalizedSession>,
    pub timestamp: DateTime<Utc>,
    pub status: CacheStatus,
    pub server_kind: ServerKind,
    pub last_error: Option<String>,
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub websocket_updates: u64,
    pub hit_rate: f64,
}

pub struct SessionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    websocket_updates: AtomicU64,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            websocket_updates: AtomicU64::new(0),
        })
    }

    /// Returned entries are copies; callers never hold the cache lock.
    pub async fn get(&self, server_id: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        match entries.get(server_id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(
        &self,
        server_id: &str,
        server_kind: ServerKind,
        sessions: Vec<NormalizedSession>,
        status: CacheStatus,
    ) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        entries.insert(
            server_id.to_string(),
            CacheEntry {
                sessions,
                timestamp: Utc::now(),
                status,
                server_kind,
                last_error: None,
            },
        );
    }

    /// Record a refresh failure: the last-known sessions are preserved and
    /// the entry is marked degraded with the error.
    pub async fn set_with_error(&self, server_id: &str, server_kind: ServerKind, error: String) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        match entries.get_mut(server_id) {
            Some(entry) => {
                entry.status = CacheStatus::Degraded;
                entry.last_error = Some(error);
            }
            None => {
                entries.insert(
                    server_id.to_string(),
                    CacheEntry {
                        sessions: Vec::new(),
                        timestamp: Utc::now(),
                        status: CacheStatus::Degraded,
                        server_kind,
                        last_error: Some(error),
                    },
                );
            }
        }
    }

    /// Update a single server's sessions from a push-stream frame.
    pub async fn set_from_push(
        &self,
        server_id: &str,
        server_kind: ServerKind,
        sessions: Vec<NormalizedSession>,
    ) {
        self.websocket_updates.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        entries.insert(
            server_id.to_string(),
            CacheEntry {
                sessions,
                timestamp: Utc::now(),
                status: CacheStatus::Fresh,
                server_kind,
                last_error: None,
            },
        );
    }

    pub async fn is_fresh(&self, server_id: &str) -> bool {
        let entries = self.entries.read().await;
        entries.get(server_id).is_some_and(|entry| {
            entry.status == CacheStatus::Fresh
                && Utc::now()
                    .signed_duration_since(entry.timestamp)
                    .to_std()
                    .map(|age| age < self.ttl)
                    .unwrap_or(false)
        })
    }

    /// Union of cached sessions across all servers, for snapshot builders.
    pub async fn all_sessions(&self) -> Vec<NormalizedSession> {
        let entries = self.entries.read().await;
        entries
            .values()
            .flat_map(|entry| entry.sessions.iter().cloned())
            .collect()
    }

    pub async fn entry_statuses(&self) -> HashMap<String, CacheStatus> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status))
            .collect()
    }

    pub fn record_websocket_update(&self) {
        self.websocket_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheMetrics {
            hits,
            misses,
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            websocket_updates: self.websocket_updates.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(server_id: &str, session_id: &str) -> NormalizedSession {
        NormalizedSession {
            server_id: server_id.into(),
            server_kind: ServerKind::Emby,
            session_id: session_id.into(),
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
            play_method_raw: String::new(),
            play_method: crate::models::PlayMethod::DirectPlay,
            video_method: crate::models::PlayMethod::DirectPlay,
            audio_method: crate::models::PlayMethod::DirectPlay,
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

    #[tokio::test]
    async fn refresh_failure_preserves_last_known_sessions() {
        let cache = SessionCache::new(Duration::from_secs(15));
        cache
            .set("emby", ServerKind::Emby, vec![session("emby", "s1")], CacheStatus::Fresh)
            .await;
        assert!(cache.is_fresh("emby").await);

        cache
            .set_with_error("emby", ServerKind::Emby, "connect timeout".into())
            .await;

        let entry = cache.get("emby").await.unwrap();
        assert_eq!(entry.status, CacheStatus::Degraded);
        assert_eq!(entry.sessions.len(), 1);
        assert_eq!(entry.last_error.as_deref(), Some("connect timeout"));
        assert!(!cache.is_fresh("emby").await);
    }

    #[tokio::test]
    async fn metrics_count_hits_misses_and_failures() {
        let cache = SessionCache::new(Duration::from_secs(15));
        assert!(cache.get("emby").await.is_none());
        cache
            .set("emby", ServerKind::Emby, vec![], CacheStatus::Fresh)
            .await;
        assert!(cache.get("emby").await.is_some());
        cache
            .set_with_error("plex", ServerKind::Plex, "boom".into())
            .await;

        let metrics = cache.get_metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.refreshes, 1);
        assert_eq!(metrics.refresh_failures, 1);
        assert!((metrics.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
