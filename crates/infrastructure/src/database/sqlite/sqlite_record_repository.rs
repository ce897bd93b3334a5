use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{
    models::{PipelineRecord, RecordStatus, RecordTypeCounts},
    traits::{RecordRepository, RecordTransaction},
    SupervisorError, SupervisorResult,
};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::database::mapping::MappingHelpers;

#[derive(Clone)]
pub struct SqliteRecordRepository {
    pool: SqlitePool,
}

impl SqliteRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &SqliteRow) -> SupervisorResult<PipelineRecord> {
        Ok(PipelineRecord {
            id: row.try_get("id")?,
            record_type: row.try_get("record_type")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            sequence_number: row.try_get("sequence_number")?,
            payload: row.try_get("payload")?,
            processed_at: row.try_get("processed_at")?,
            skip_reason: row.try_get("skip_reason")?,
        })
    }

    /// 把某类型中内容为空的 pending 记录标记为 skipped，批量处理器使用
    pub async fn skip_blank_payloads(
        &self,
        record_type: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SupervisorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET status = 'skipped', skip_reason = ?, processed_at = ?
            WHERE record_type = ?
              AND status = 'pending'
              AND (payload IS NULL OR trim(payload) = '')
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(record_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecordRepository for SqliteRecordRepository {
    async fn insert(&self, record: &PipelineRecord) -> SupervisorResult<PipelineRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO records (record_type, status, sequence_number, payload, processed_at, skip_reason)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.record_type)
        .bind(record.status.as_str())
        .bind(record.sequence_number)
        .bind(&record.payload)
        .bind(record.processed_at)
        .bind(&record.skip_reason)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_by_id(id)
            .await?
            .ok_or(SupervisorError::RecordNotFound { id })
    }

    async fn get_by_id(&self, id: i64) -> SupervisorResult<Option<PipelineRecord>> {
        let row = sqlx::query("SELECT * FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn count_pending(&self) -> SupervisorResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM records WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        MappingHelpers::count(&row, "total")
    }

    async fn counts_by_type(&self) -> SupervisorResult<Vec<RecordTypeCounts>> {
        let rows = sqlx::query(
            r#"
            SELECT
                record_type,
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'processed' THEN 1 ELSE 0 END) AS processed,
                SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END) AS skipped
            FROM records
            GROUP BY record_type
            ORDER BY record_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SupervisorResult<RecordTypeCounts> {
                Ok(RecordTypeCounts {
                    record_type: row.try_get("record_type")?,
                    pending: MappingHelpers::count(row, "pending")?,
                    processed: MappingHelpers::count(row, "processed")?,
                    skipped: MappingHelpers::count(row, "skipped")?,
                })
            })
            .collect()
    }

    async fn mark_pending_processed(
        &self,
        record_type: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SupervisorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET status = 'processed', processed_at = ?
            WHERE status = 'pending'
              AND id IN (
                  SELECT id FROM records
                  WHERE record_type = ? AND status = 'pending'
                  ORDER BY id
                  LIMIT ?
              )
            "#,
        )
        .bind(now)
        .bind(record_type)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        debug!("{} 批量标记 {} 条记录", record_type, result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn list_pending(
        &self,
        record_types: &[String],
        limit: usize,
    ) -> SupervisorResult<Vec<PipelineRecord>> {
        if record_types.is_empty() {
            return Ok(vec![]);
        }

        let sql = format!(
            r#"
            SELECT * FROM records
            WHERE status = 'pending' AND record_type IN ({})
            ORDER BY sequence_number IS NULL, sequence_number, id
            LIMIT ?
            "#,
            MappingHelpers::placeholders(record_types.len())
        );

        let mut query = sqlx::query(&sql);
        for record_type in record_types {
            query = query.bind(record_type);
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn mark_skipped(
        &self,
        id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SupervisorResult<bool> {
        let result = sqlx::query(
            "UPDATE records SET status = ?, skip_reason = ?, processed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(RecordStatus::Skipped.as_str())
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn begin(&self) -> SupervisorResult<Box<dyn RecordTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteRecordTransaction { tx }))
    }
}

/// 单条记录处理事务，未提交即丢弃时自动回滚
pub struct SqliteRecordTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl RecordTransaction for SqliteRecordTransaction {
    async fn mark_processed(&mut self, id: i64, now: DateTime<Utc>) -> SupervisorResult<bool> {
        let result = sqlx::query(
            "UPDATE records SET status = 'processed', processed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> SupervisorResult<()> {
        let SqliteRecordTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SupervisorResult<()> {
        let SqliteRecordTransaction { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}
