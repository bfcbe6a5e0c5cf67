//! Remote manager settings.

use crate::error::DatabaseError;
use crate::{Error, Result};
use async_trait::async_trait;

use super::{ManagerSettingsSource, RemoteSettings, SqliteTaskStore};

#[async_trait]
impl ManagerSettingsSource for SqliteTaskStore {
    async fn load_settings(&self, manager: &str) -> Result<RemoteSettings> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, value FROM manager_settings WHERE manager = ?")
                .bind(manager)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to load settings for {}: {}",
                        manager, e
                    )))
                })?;

        Ok(RemoteSettings::from_pairs(rows))
    }

    async fn set_setting(&self, manager: &str, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manager_settings (manager, name, value)
            VALUES (?, ?, ?)
            ON CONFLICT(manager, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(manager)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set {} for {}: {}",
                name, manager, e
            )))
        })?;

        Ok(())
    }

    async fn ack_update_required(&self, manager: &str) -> Result<()> {
        self.set_setting(manager, RemoteSettings::UPDATE_REQUIRED, "False")
            .await
    }
}
