use anyhow::Result;
use sqlx::Row;

use super::{with_busy_retry, Database};
use crate::models::{ServerKind, User};

impl Database {
    pub async fn upsert_user(&self, user: &User, now: i64) -> Result<()> {
        let _guard = self.write_guard().await;
        let pool = self.pool().clone();
        let user = user.clone();
        with_busy_retry("upsert user", || {
            let pool = pool.clone();
            let user = user.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO users (id, server_id, server_type, display_name, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT (id, server_id) DO UPDATE SET
                        server_type = excluded.server_type,
                        display_name = excluded.display_name,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&user.id)
                .bind(&user.server_id)
                .bind(user.server_type.as_str())
                .bind(&user.display_name)
                .bind(now)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    pub async fn upsert_users(&self, users: &[User], now: i64) -> Result<()> {
        for user in users {
            self.upsert_user(user, now).await?;
        }
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT id, server_id, server_type, display_name FROM users ORDER BY display_name")
            .fetch_all(self.pool())
            .await?;

        let mut users = Vec::new();
        for row in rows {
            let server_type_str: String = row.get("server_type");
            let Some(server_type) = ServerKind::parse(&server_type_str) else {
                continue;
            };
            users.push(User {
                id: row.get("id"),
                server_id: row.get("server_id"),
                server_type,
                display_name: row.get("display_name"),
            });
        }
        Ok(users)
    }

    pub async fn get_user_display_name(&self, user_id: &str) -> Result<Option<String>> {
        let name = sqlx::query_scalar::<_, String>(
            "SELECT display_name FROM users WHERE id = ? LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(name)
    }
}
