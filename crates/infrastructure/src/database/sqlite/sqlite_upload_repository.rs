use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{models::OrphanedUpload, traits::UploadRecovery, Clock, SupervisorResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::database::mapping::MappingHelpers;

/// 上传会话仍处于这些状态且长时间没有更新时视为孤儿
const IN_FLIGHT_STATUSES: &[&str] = &["uploading", "processing"];

pub struct SqliteUploadRepository {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteUploadRepository {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// 登记或更新一个上传会话
    pub async fn upsert(&self, id: &str, filename: &str, status: &str) -> SupervisorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO uploads (id, filename, status, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(filename)
        .bind(status)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn status_of(&self, id: &str) -> SupervisorResult<Option<String>> {
        let row = sqlx::query("SELECT status FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("status")?),
            None => None,
        })
    }
}

#[async_trait]
impl UploadRecovery for SqliteUploadRepository {
    async fn find_orphaned_uploads(
        &self,
        stale_before: DateTime<Utc>,
    ) -> SupervisorResult<Vec<OrphanedUpload>> {
        let sql = format!(
            "SELECT id, filename, status FROM uploads WHERE status IN ({}) AND updated_at < ? ORDER BY updated_at",
            MappingHelpers::placeholders(IN_FLIGHT_STATUSES.len())
        );
        let mut query = sqlx::query(&sql);
        for status in IN_FLIGHT_STATUSES {
            query = query.bind(*status);
        }
        let rows = query.bind(stale_before).fetch_all(&self.pool).await?;

        let uploads = rows
            .iter()
            .map(|row| -> SupervisorResult<OrphanedUpload> {
                Ok(OrphanedUpload {
                    id: row.try_get("id")?,
                    filename: row.try_get("filename")?,
                    status: row.try_get("status")?,
                })
            })
            .collect::<SupervisorResult<Vec<_>>>()?;

        debug!("发现 {} 个孤儿上传", uploads.len());
        Ok(uploads)
    }

    /// 重新排队，已经不在传输中的会话保持不变
    async fn recover(&self, ids: &[String]) -> SupervisorResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE uploads SET status = 'queued', updated_at = ? WHERE id IN ({}) AND status IN ({})",
            MappingHelpers::placeholders(ids.len()),
            MappingHelpers::placeholders(IN_FLIGHT_STATUSES.len())
        );
        let mut query = sqlx::query(&sql).bind(self.clock.now());
        for id in ids {
            query = query.bind(id);
        }
        for status in IN_FLIGHT_STATUSES {
            query = query.bind(*status);
        }
        let result = query.execute(&self.pool).await?;

        info!("重新排队 {} 个孤儿上传", result.rows_affected());
        Ok(result.rows_affected())
    }
}
