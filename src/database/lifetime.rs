use anyhow::Result;
use sqlx::Row;

use super::{with_busy_retry, Database};
use crate::models::LifetimeWatch;

impl Database {
    /// Replace a user's lifetime counters. `total_ms` is recomputed by the
    /// caller according to the configured inclusion policy.
    pub async fn upsert_lifetime_watch(&self, watch: &LifetimeWatch, now: i64) -> Result<()> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        let watch = watch.clone();
        with_busy_retry("upsert lifetime watch", || {
            let pool = pool.clone();
            let watch = watch.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO lifetime_watch (user_id, total_ms, emby_ms, trakt_ms, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT (user_id) DO UPDATE SET
                        total_ms = excluded.total_ms,
                        emby_ms = excluded.emby_ms,
                        trakt_ms = excluded.trakt_ms,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&watch.user_id)
                .bind(watch.total_ms)
                .bind(watch.emby_ms)
                .bind(watch.trakt_ms)
                .bind(now)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    pub async fn get_lifetime_watch(&self, user_id: &str) -> Result<Option<LifetimeWatch>> {
        let row = sqlx::query(
            "SELECT user_id, total_ms, emby_ms, trakt_ms FROM lifetime_watch WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|row| LifetimeWatch {
            user_id: row.get("user_id"),
            total_ms: row.get("total_ms"),
            emby_ms: row.get("emby_ms"),
            trakt_ms: row.get("trakt_ms"),
        }))
    }

    pub async fn top_lifetime_watch(&self, limit: i64) -> Result<Vec<(LifetimeWatch, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT lw.user_id, lw.total_ms, lw.emby_ms, lw.trakt_ms,
                   COALESCE(u.display_name, lw.user_id) AS display_name
            FROM lifetime_watch lw
            LEFT JOIN users u ON u.id = lw.user_id
            ORDER BY lw.total_ms DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    LifetimeWatch {
                        user_id: row.get("user_id"),
                        total_ms: row.get("total_ms"),
                        emby_ms: row.get("emby_ms"),
                        trakt_ms: row.get("trakt_ms"),
                    },
                    row.get("display_name"),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifetime_counters_are_replaced_not_accumulated() {
        let db = Database::new_in_memory().await.unwrap();
        let watch = LifetimeWatch {
            user_id: "u1".into(),
            total_ms: 1_000,
            emby_ms: 600,
            trakt_ms: 400,
        };
        db.upsert_lifetime_watch(&watch, 100).await.unwrap();
        db.upsert_lifetime_watch(&watch, 200).await.unwrap();

        let top = db.top_lifetime_watch(10).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0.total_ms, 1_000);
        // No users row yet, display name falls back to the id.
        assert_eq!(top[0].1, "u1");
    }
}
