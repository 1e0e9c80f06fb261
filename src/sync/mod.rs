//! User and library synchronization.
//!
//! Keeps the local users and library-item tables fresh enough to enrich
//! sessions and intervals, and refreshes the lifetime watch counters from
//! upstream played flags (played items x runtime). Runs once synchronously
//! at startup, then on two independent cadences: a frequent item/lifetime
//! refresh and a rare full user sync.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{StatsConfig, SyncConfig};
use crate::database::Database;
use crate::models::LifetimeWatch;
use crate::sources::SourceManager;
use crate::utils::time::{now_ts, ticks_to_ms};

pub struct SyncService {
    db: Database,
    manager: Arc<SourceManager>,
    cfg: SyncConfig,
    stats_cfg: StatsConfig,
}

impl SyncService {
    pub fn new(
        db: Database,
        manager: Arc<SourceManager>,
        cfg: SyncConfig,
        stats_cfg: StatsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            manager,
            cfg,
            stats_cfg,
        })
    }

    /// Startup sync. Failures are logged, not fatal: the poller works
    /// without enrichment data.
    pub async fn initial_sync(&self) {
        if let Err(e) = self.sync_users().await {
            warn!(error = %e, "initial user sync failed");
        }
        if let Err(e) = self.sync_user_data().await {
            warn!(error = %e, "initial library sync failed");
        }
    }

    pub async fn sync_users(&self) -> anyhow::Result<usize> {
        let now = now_ts();
        let mut count = 0;
        for client in self.manager.clients() {
            match client.get_users().await {
                Ok(users) => {
                    count += users.len();
                    self.db.upsert_users(&users, now).await?;
                }
                Err(e) => {
                    warn!(server_id = client.server_id(), error = %e, "user sync failed");
                }
            }
        }
        info!(users = count, "user sync complete");
        Ok(count)
    }

    /// Refresh library items and lifetime counters from each user's
    /// played flags. Servers that cannot report per-user watch data are
    /// skipped quietly.
    pub async fn sync_user_data(&self) -> anyhow::Result<()> {
        let now = now_ts();
        let users = self.db.list_users().await?;

        for user in &users {
            let Ok(client) = self.manager.client(&user.server_id) else {
                continue;
            };
            let data = match client.get_user_data(&user.id).await {
                Ok(data) => data,
                Err(crate::errors::SourceError::UnsupportedFeature { .. }) => continue,
                Err(e) => {
                    warn!(user_id = %user.id, error = %e, "user data sync failed");
                    continue;
                }
            };

            let mut played_ms = 0i64;
            for chunk in data.chunks(self.cfg.refresh_chunk_size.max(1)) {
                let items: Vec<_> = chunk.iter().map(|entry| entry.item.clone()).collect();
                self.db.upsert_library_items(&items, now).await?;
                played_ms += chunk
                    .iter()
                    .filter(|entry| entry.played)
                    .filter_map(|entry| entry.item.runtime_ticks)
                    .map(ticks_to_ms)
                    .sum::<i64>();
            }

            // Trakt counters come from an external importer; keep them.
            let trakt_ms = self
                .db
                .get_lifetime_watch(&user.id)
                .await?
                .map(|watch| watch.trakt_ms)
                .unwrap_or(0);
            let total_ms = if self.stats_cfg.include_trakt {
                played_ms + trakt_ms
            } else {
                played_ms
            };
            self.db
                .upsert_lifetime_watch(
                    &LifetimeWatch {
                        user_id: user.id.clone(),
                        total_ms,
                        emby_ms: played_ms,
                        trakt_ms,
                    },
                    now,
                )
                .await?;
            debug!(user_id = %user.id, played_ms, "lifetime counters refreshed");
        }
        info!(users = users.len(), "library sync complete");
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut item_ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.sync_interval_seconds.max(30),
        ));
        let mut user_ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.user_sync_interval_seconds.max(60),
        ));
        // Both tickers fire immediately; the startup sync already ran.
        item_ticker.tick().await;
        user_ticker.tick().await;

        loop {
            tokio::select! {
                _ = item_ticker.tick() => {
                    if let Err(e) = self.sync_user_data().await {
                        warn!(error = %e, "periodic library sync failed");
                    }
                }
                _ = user_ticker.tick() => {
                    if let Err(e) = self.sync_users().await {
                        warn!(error = %e, "periodic user sync failed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("sync loop stopping");
                    return;
                }
            }
        }
    }
}
