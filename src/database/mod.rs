//! Store layer.
//!
//! SQLite is treated as a single-writer, many-readers store: WAL journal
//! mode, a busy timeout of 5 seconds, and a process-wide write lock so at
//! most one mutating statement is in flight. Every mutation goes through
//! the bounded busy-retry helper.

use crate::assets::MigrationAssets;
use crate::config::DatabaseConfig;
use crate::errors::StoreError;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub mod items;
pub mod lifetime;
pub mod sessions;
pub mod users;

const BUSY_RETRY_ATTEMPTS: u32 = 8;
const BUSY_RETRY_INITIAL: Duration = Duration::from_millis(25);
const BUSY_RETRY_CAP: Duration = Duration::from_millis(800);

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(5))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// In-memory store for tests. A single connection keeps the database
    /// alive for the lifetime of the pool.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Serialize writers. Held for the duration of a single statement (or
    /// one small statement group), never across upstream I/O.
    pub async fn write_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                description TEXT NOT NULL,
                installed_on TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                success BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, content) in MigrationAssets::get_migrations() {
            let version: i64 = name
                .split('_')
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default();

            let applied = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM _migrations WHERE version = ? AND success = true",
            )
            .bind(version)
            .fetch_one(&self.pool)
            .await?;

            if applied > 0 {
                continue;
            }

            let start = std::time::Instant::now();
            let mut transaction = self.pool.begin().await?;

            for statement in split_statements(&content) {
                if let Err(e) = sqlx::query(statement).execute(&mut *transaction).await {
                    transaction.rollback().await?;
                    return Err(StoreError::MigrationFailed {
                        name: name.clone(),
                        message: e.to_string(),
                    }
                    .into());
                }
            }

            sqlx::query("INSERT INTO _migrations (version, description, success) VALUES (?, ?, true)")
                .bind(version)
                .bind(&name)
                .execute(&mut *transaction)
                .await?;
            transaction.commit().await?;
            info!(
                "Applied migration: {} ({}ms)",
                name,
                start.elapsed().as_millis()
            );
        }

        Ok(())
    }
}

/// Split a migration file into individual statements. SQLite prepares one
/// statement at a time.
fn split_statements(content: &str) -> impl Iterator<Item = &str> {
    content
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.lines().all(|line| line.trim().starts_with("--")))
}

fn is_busy_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("busy") || message.contains("locked")
        }
        _ => false,
    }
}

/// Run a mutating statement with bounded exponential retry on transient
/// busy/locked errors: 8 attempts, 25ms initial delay, doubling, capped at
/// 800ms. Non-busy errors propagate immediately.
pub async fn with_busy_retry<T, F, Fut>(operation: &str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = BUSY_RETRY_INITIAL;
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy_error(&e) => {
                if attempt >= BUSY_RETRY_ATTEMPTS {
                    warn!(
                        operation,
                        attempts = attempt,
                        "store still busy, giving up"
                    );
                    return Err(StoreError::BusyExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BUSY_RETRY_CAP);
                attempt += 1;
            }
            Err(e) => return Err(StoreError::Sqlx(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_splitting_skips_comment_only_chunks() {
        let sql = "-- leading comment\nCREATE TABLE a (x INTEGER);\n\nCREATE TABLE b (y INTEGER);\n";
        let statements: Vec<&str> = split_statements(sql).collect();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE a"));
        assert!(statements[1].starts_with("CREATE TABLE b"));
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let db = Database::new_in_memory().await.unwrap();
        // Second run must be a no-op, not a failure.
        db.migrate().await.unwrap();

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _migrations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert!(applied >= 1);
    }

    #[tokio::test]
    async fn busy_retry_passes_through_non_busy_errors() {
        let result: Result<(), StoreError> = with_busy_retry("test op", || async {
            Err(sqlx::Error::RowNotFound)
        })
        .await;
        assert!(matches!(result, Err(StoreError::Sqlx(_))));
    }

    #[tokio::test]
    async fn busy_retry_returns_first_success() {
        let mut calls = 0;
        let result = with_busy_retry("test op", || {
            calls += 1;
            async move { Ok::<_, sqlx::Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls, 1);
    }
}
