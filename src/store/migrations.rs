//! Store lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::SqliteTaskStore;

impl SqliteTaskStore {
    /// Open (creating if needed) the store at `path` and run migrations
    ///
    /// `busy_retries` bounds how often a busy database is retried inside one
    /// request before the request reports `TooManyRetries`.
    pub async fn new(path: &Path, busy_retries: u32) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create task store directory: {}",
                    e
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse task store path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to task store: {}",
                e
            )))
        })?;

        let store = Self { pool, busy_retries };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: tasks, manager settings and manager activity
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying task store migration v1");

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            Self::create_tasks_schema(conn).await?;
            Self::create_settings_schema(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v1: {}",
                            e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Task store migration v1 complete");
        Ok(())
    }

    async fn create_tasks_schema(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE capture_tasks (
                job INTEGER NOT NULL,
                step INTEGER NOT NULL,
                step_tool TEXT NOT NULL,
                dataset TEXT NOT NULL,
                params TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                state INTEGER NOT NULL DEFAULT 0,
                processor TEXT,
                assigned_at INTEGER,
                closeout_code INTEGER,
                closeout_msg TEXT,
                eval_code INTEGER,
                eval_msg TEXT,
                completed_at INTEGER,
                PRIMARY KEY (job, step)
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create capture_tasks table: {}",
                e
            )))
        })?;

        sqlx::query(
            "CREATE INDEX idx_capture_tasks_state ON capture_tasks(state, priority DESC, job, step)",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create index: {}",
                e
            )))
        })?;

        Ok(())
    }

    async fn create_settings_schema(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE manager_settings (
                manager TEXT NOT NULL,
                name TEXT NOT NULL COLLATE NOCASE,
                value TEXT NOT NULL,
                PRIMARY KEY (manager, name)
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create manager_settings table: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE manager_activity (
                manager TEXT PRIMARY KEY,
                version TEXT,
                last_request_at INTEGER,
                idle_reported_at INTEGER
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create manager_activity table: {}",
                e
            )))
        })?;

        Ok(())
    }

    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    version, e
                )))
            })?;
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(self) {
        self.pool.close().await;
    }
}
