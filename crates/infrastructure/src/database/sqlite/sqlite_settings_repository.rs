use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{
    traits::{PauseFlag, RebuildCooldownStore},
    SupervisorError, SupervisorResult,
};
use sqlx::{Row, SqlitePool};
use tracing::info;

/// 运维暂停开关在 settings 表中的键
pub const PROCESSING_PAUSED_KEY: &str = "processing_paused";

/// 最近一次缓存重建触发时间在 settings 表中的键
pub const LAST_REBUILD_TRIGGERED_KEY: &str = "last_rebuild_triggered_at";

/// 键值设置表
#[derive(Clone)]
pub struct SqliteSettingsRepository {
    pool: SqlitePool,
}

impl SqliteSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> SupervisorResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn set(&self, key: &str, value: &str, now: DateTime<Utc>) -> SupervisorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_paused(&self, paused: bool, now: DateTime<Utc>) -> SupervisorResult<()> {
        self.set(PROCESSING_PAUSED_KEY, if paused { "true" } else { "false" }, now)
            .await?;
        info!("流水线暂停开关已设置为 {}", paused);
        Ok(())
    }
}

#[async_trait]
impl PauseFlag for SqliteSettingsRepository {
    async fn is_paused(&self) -> SupervisorResult<bool> {
        let value = self.get(PROCESSING_PAUSED_KEY).await?;
        Ok(value.is_some_and(|v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
        }))
    }
}

fn parse_timestamp(value: &str) -> SupervisorResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SupervisorError::Serialization(format!("无效的时间戳 {value}: {e}")))
}

#[async_trait]
impl RebuildCooldownStore for SqliteSettingsRepository {
    async fn last_triggered_at(&self) -> SupervisorResult<Option<DateTime<Utc>>> {
        match self.get(LAST_REBUILD_TRIGGERED_KEY).await? {
            Some(value) => Ok(Some(parse_timestamp(&value)?)),
            None => Ok(None),
        }
    }

    async fn swap_triggered_at(
        &self,
        expected: Option<DateTime<Utc>>,
        value: Option<DateTime<Utc>>,
    ) -> SupervisorResult<bool> {
        let result = match (expected, value) {
            (None, None) => return Ok(self.get(LAST_REBUILD_TRIGGERED_KEY).await?.is_none()),
            (None, Some(value)) => {
                sqlx::query(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) ON CONFLICT(key) DO NOTHING",
                )
                .bind(LAST_REBUILD_TRIGGERED_KEY)
                .bind(value.to_rfc3339())
                .bind(value)
                .execute(&self.pool)
                .await?
            }
            (Some(expected), Some(value)) => {
                sqlx::query(
                    "UPDATE settings SET value = ?, updated_at = ? WHERE key = ? AND value = ?",
                )
                .bind(value.to_rfc3339())
                .bind(value)
                .bind(LAST_REBUILD_TRIGGERED_KEY)
                .bind(expected.to_rfc3339())
                .execute(&self.pool)
                .await?
            }
            (Some(expected), None) => {
                sqlx::query("DELETE FROM settings WHERE key = ? AND value = ?")
                    .bind(LAST_REBUILD_TRIGGERED_KEY)
                    .bind(expected.to_rfc3339())
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}
