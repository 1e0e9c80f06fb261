use anyhow::Result;
use sqlx::Row;

use super::{with_busy_retry, Database};
use crate::models::LibraryItem;

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> LibraryItem {
    LibraryItem {
        id: row.get("id"),
        server_id: row.get("server_id"),
        item_type: row.get("item_type"),
        name: row.get("name"),
        series_id: row.get("series_id"),
        series_name: row.get("series_name"),
        season_index: row.get("season_index"),
        episode_index: row.get("episode_index"),
        runtime_ticks: row.get("runtime_ticks"),
        container: row.get("container"),
        video_codec: row.get("video_codec"),
        audio_codec: row.get("audio_codec"),
        resolution: row.get("resolution"),
        file_path: row.get("file_path"),
        genres: row.get("genres"),
    }
}

const ITEM_COLUMNS: &str = "id, server_id, item_type, name, series_id, series_name, \
     season_index, episode_index, runtime_ticks, container, video_codec, audio_codec, \
     resolution, file_path, genres";

impl Database {
    pub async fn upsert_library_item(&self, item: &LibraryItem, now: i64) -> Result<()> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        let item = item.clone();
        with_busy_retry("upsert library item", || {
            let pool = pool.clone();
            let item = item.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO library_items (
                        id, server_id, item_type, name, series_id, series_name,
                        season_index, episode_index, runtime_ticks, container,
                        video_codec, audio_codec, resolution, file_path, genres,
                        updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (id) DO UPDATE SET
                        server_id = excluded.server_id,
                        item_type = excluded.item_type,
                        name = excluded.name,
                        series_id = excluded.series_id,
                        series_name = excluded.series_name,
                        season_index = excluded.season_index,
                        episode_index = excluded.episode_index,
                        runtime_ticks = excluded.runtime_ticks,
                        container = excluded.container,
                        video_codec = excluded.video_codec,
                        audio_codec = excluded.audio_codec,
                        resolution = excluded.resolution,
                        file_path = excluded.file_path,
                        genres = excluded.genres,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&item.id)
                .bind(&item.server_id)
                .bind(&item.item_type)
                .bind(&item.name)
                .bind(&item.series_id)
                .bind(&item.series_name)
                .bind(item.season_index)
                .bind(item.episode_index)
                .bind(item.runtime_ticks)
                .bind(&item.container)
                .bind(&item.video_codec)
                .bind(&item.audio_codec)
                .bind(&item.resolution)
                .bind(&item.file_path)
                .bind(&item.genres)
                .bind(now)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    pub async fn upsert_library_items(&self, items: &[LibraryItem], now: i64) -> Result<()> {
        for item in items {
            self.upsert_library_item(item, now).await?;
        }
        Ok(())
    }

    pub async fn get_library_item(&self, id: &str) -> Result<Option<LibraryItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM library_items WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(item_from_row))
    }

    pub async fn get_library_items(&self, ids: &[String]) -> Result<Vec<LibraryItem>> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.get_library_item(id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn library_item_round_trips_and_updates() {
        let db = Database::new_in_memory().await.unwrap();
        let item = LibraryItem {
            id: "i1".into(),
            server_id: "emby".into(),
            item_type: "Episode".into(),
            name: "Pilot".into(),
            series_name: Some("Some Show".into()),
            season_index: Some(1),
            episode_index: Some(1),
            runtime_ticks: Some(18_000_000_000),
            video_codec: Some("hevc".into()),
            ..Default::default()
        };
        db.upsert_library_item(&item, 100).await.unwrap();

        let loaded = db.get_library_item("i1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Pilot");
        assert_eq!(loaded.runtime_ticks, Some(18_000_000_000));

        let mut updated = item.clone();
        updated.name = "Pilot (remastered)".into();
        db.upsert_library_item(&updated, 200).await.unwrap();
        let loaded = db.get_library_item("i1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Pilot (remastered)");

        assert!(db.get_library_item("missing").await.unwrap().is_none());
    }
}
