use async_trait::async_trait;
use ingest_core::{
    models::{AlertLevel, AlertRow, MetricsSnapshotRow},
    traits::AlertLogSink,
    SupervisorError, SupervisorResult,
};
use sqlx::{Row, SqlitePool};

use crate::database::mapping::MappingHelpers;

/// 告警与指标快照的只追加日志
pub struct SqliteAlertLog {
    pool: SqlitePool,
}

impl SqliteAlertLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 最近写入的告警，新的在前
    pub async fn recent_alerts(&self, limit: usize) -> SupervisorResult<Vec<AlertRow>> {
        let rows = sqlx::query(
            "SELECT level, category, message, details, created_at FROM alert_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SupervisorResult<AlertRow> {
                Ok(AlertRow {
                    level: parse_level(&row.try_get::<String, _>("level")?)?,
                    category: row.try_get("category")?,
                    message: row.try_get("message")?,
                    details: MappingHelpers::parse_json(row, "details")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn count_metrics_snapshots(&self) -> SupervisorResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM metrics_snapshots")
            .fetch_one(&self.pool)
            .await?;
        MappingHelpers::count(&row, "total")
    }
}

fn parse_level(value: &str) -> SupervisorResult<AlertLevel> {
    match value {
        "info" => Ok(AlertLevel::Info),
        "warning" => Ok(AlertLevel::Warning),
        "error" => Ok(AlertLevel::Error),
        "critical" => Ok(AlertLevel::Critical),
        other => Err(SupervisorError::Serialization(format!(
            "Invalid alert level: {other}"
        ))),
    }
}

#[async_trait]
impl AlertLogSink for SqliteAlertLog {
    async fn append_alert(&self, row: &AlertRow) -> SupervisorResult<()> {
        let details = serde_json::to_string(&row.details)?;
        sqlx::query(
            "INSERT INTO alert_log (level, category, message, details, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(row.level.as_str())
        .bind(&row.category)
        .bind(&row.message)
        .bind(details)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_metrics(&self, row: &MetricsSnapshotRow) -> SupervisorResult<()> {
        let record_counts = serde_json::to_string(&row.record_counts)?;
        sqlx::query(
            r#"
            INSERT INTO metrics_snapshots (
                captured_at, record_counts, total_pending, total_processed, total_skipped,
                queued_jobs, processing_jobs, failed_jobs, stuck_jobs
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.captured_at)
        .bind(record_counts)
        .bind(row.total_pending as i64)
        .bind(row.total_processed as i64)
        .bind(row.total_skipped as i64)
        .bind(row.queued_jobs as i64)
        .bind(row.processing_jobs as i64)
        .bind(row.failed_jobs as i64)
        .bind(row.stuck_jobs as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_database;
    use chrono::{TimeZone, Utc};
    use ingest_core::models::{Alert, AlertKind, RecordTypeCounts};

    #[tokio::test]
    async fn test_alert_rows_round_trip_with_details() {
        let log = memory_database().await.alert_log();
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let alert = Alert::new(
            AlertLevel::Critical,
            AlertKind::QueueBacklog {
                queued: 150,
                threshold: 100,
            },
            "队列严重积压",
            at,
        );

        log.append_alert(&alert.to_row()).await.unwrap();

        let rows = log.recent_alerts(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level, AlertLevel::Critical);
        assert_eq!(rows[0].category, "queue_backlog");
        assert_eq!(rows[0].details["queued"], 150);
        assert_eq!(rows[0].created_at, at);
    }

    #[tokio::test]
    async fn test_metrics_rows_are_appended() {
        let log = memory_database().await.alert_log();
        let row = MetricsSnapshotRow {
            captured_at: Utc::now(),
            record_counts: vec![RecordTypeCounts::new("DT")],
            total_pending: 500,
            total_processed: 10,
            total_skipped: 1,
            queued_jobs: 3,
            processing_jobs: 1,
            failed_jobs: 0,
            stuck_jobs: 0,
        };

        log.append_metrics(&row).await.unwrap();
        log.append_metrics(&row).await.unwrap();

        assert_eq!(log.count_metrics_snapshots().await.unwrap(), 2);
    }
}
