//! 派生缓存的进程内重建
//!
//! 缓存按年份分区，每个分区按月拆成 12 个重建单元。每个单元在一个事务里
//! 删除旧条目并从已处理记录重新聚合，进度保存在内存中的作业表里，
//! 由监督器的缓存检查周期读取和清理。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Datelike;
use ingest_core::{
    models::{CachePartitionStatus, CacheRebuildJob, CacheRebuildStatus},
    traits::CacheRebuilder,
    Clock, SupervisorError, SupervisorResult,
};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::database::mapping::MappingHelpers;

const MONTHS_PER_PARTITION: u32 = 12;

type JobTable = Arc<Mutex<HashMap<String, CacheRebuildJob>>>;

pub struct SqliteCacheRebuilder {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    jobs: JobTable,
}

impl SqliteCacheRebuilder {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn validate_partition_key(partition_key: &str) -> SupervisorResult<()> {
        let is_year = partition_key.len() == 4 && partition_key.chars().all(|c| c.is_ascii_digit());
        if is_year {
            Ok(())
        } else {
            Err(SupervisorError::CacheRebuild(format!(
                "无效的分区键: {partition_key}，应为四位年份"
            )))
        }
    }
}

async fn rebuild_unit(
    pool: &SqlitePool,
    clock: &Arc<dyn Clock>,
    partition_key: &str,
    period: &str,
) -> SupervisorResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM cache_entries WHERE partition_key = ? AND period = ?")
        .bind(partition_key)
        .bind(period)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO cache_entries (partition_key, period, record_type, record_count, refreshed_at)
        SELECT ?, ?, record_type, COUNT(*), ?
        FROM records
        WHERE status = 'processed'
          AND processed_at IS NOT NULL
          AND substr(processed_at, 1, 7) = ?
        GROUP BY record_type
        "#,
    )
    .bind(partition_key)
    .bind(period)
    .bind(clock.now())
    .bind(period)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn finish_partition(
    pool: &SqlitePool,
    clock: &Arc<dyn Clock>,
    partition_key: &str,
) -> SupervisorResult<()> {
    sqlx::query(
        r#"
        INSERT INTO cache_partitions (partition_key, entry_count, refreshed_at)
        VALUES (?, (SELECT COUNT(*) FROM cache_entries WHERE partition_key = ?), ?)
        ON CONFLICT(partition_key) DO UPDATE SET
            entry_count = excluded.entry_count,
            refreshed_at = excluded.refreshed_at
        "#,
    )
    .bind(partition_key)
    .bind(partition_key)
    .bind(clock.now())
    .execute(pool)
    .await?;
    Ok(())
}

async fn run_rebuild(pool: SqlitePool, clock: Arc<dyn Clock>, jobs: JobTable, partition_key: String) {
    for month in 1..=MONTHS_PER_PARTITION {
        let period = format!("{partition_key}-{month:02}");
        if let Some(job) = jobs.lock().await.get_mut(&partition_key) {
            job.current_unit = Some(period.clone());
        }

        if let Err(e) = rebuild_unit(&pool, &clock, &partition_key, &period).await {
            error!("重建缓存单元 {} 失败: {}", period, e);
            if let Some(job) = jobs.lock().await.get_mut(&partition_key) {
                job.status = CacheRebuildStatus::Failed;
                job.error = Some(e.to_string());
            }
            return;
        }

        if let Some(job) = jobs.lock().await.get_mut(&partition_key) {
            job.completed_units = month;
        }
        debug!("缓存单元 {} 已重建", period);
    }

    let outcome = finish_partition(&pool, &clock, &partition_key).await;
    if let Some(job) = jobs.lock().await.get_mut(&partition_key) {
        job.current_unit = None;
        match outcome {
            Ok(()) => job.status = CacheRebuildStatus::Completed,
            Err(e) => {
                job.status = CacheRebuildStatus::Failed;
                job.error = Some(e.to_string());
            }
        }
    }
}

#[async_trait]
impl CacheRebuilder for SqliteCacheRebuilder {
    async fn start(&self, partition_key: &str) -> SupervisorResult<()> {
        Self::validate_partition_key(partition_key)?;

        {
            let mut jobs = self.jobs.lock().await;
            if jobs.get(partition_key).is_some_and(|j| j.is_running()) {
                return Err(SupervisorError::CacheRebuild(format!(
                    "分区 {partition_key} 正在重建"
                )));
            }
            let mut job = CacheRebuildJob::new(partition_key, MONTHS_PER_PARTITION);
            job.status = CacheRebuildStatus::Running;
            jobs.insert(partition_key.to_string(), job);
        }

        info!("开始重建缓存分区 {}", partition_key);
        tokio::spawn(run_rebuild(
            self.pool.clone(),
            self.clock.clone(),
            self.jobs.clone(),
            partition_key.to_string(),
        ));
        Ok(())
    }

    async fn active_jobs(&self) -> SupervisorResult<Vec<CacheRebuildJob>> {
        let jobs = self.jobs.lock().await;
        let mut list: Vec<CacheRebuildJob> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.partition_key.cmp(&b.partition_key));
        Ok(list)
    }

    async fn cleanup_completed(&self) -> SupervisorResult<u64> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.is_running());
        Ok((before - jobs.len()) as u64)
    }

    /// 有已处理记录的年份和当前年份都应当有分区
    async fn partition_statuses(&self) -> SupervisorResult<Vec<CachePartitionStatus>> {
        let mut partitions: BTreeMap<String, CachePartitionStatus> = BTreeMap::new();
        let mut expect = |key: String| {
            partitions
                .entry(key.clone())
                .or_insert_with(|| CachePartitionStatus {
                    partition_key: key,
                    entry_count: 0,
                    refreshed_at: None,
                });
        };

        expect(self.clock.now().year().to_string());
        let years = sqlx::query(
            "SELECT DISTINCT substr(processed_at, 1, 4) AS year FROM records WHERE status = 'processed' AND processed_at IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &years {
            expect(row.try_get("year")?);
        }

        let rows = sqlx::query("SELECT partition_key, entry_count, refreshed_at FROM cache_partitions")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let key: String = row.try_get("partition_key")?;
            partitions.insert(
                key.clone(),
                CachePartitionStatus {
                    partition_key: key,
                    entry_count: MappingHelpers::count(row, "entry_count")?,
                    refreshed_at: row.try_get("refreshed_at")?,
                },
            );
        }

        Ok(partitions.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_database;
    use chrono::{TimeZone, Utc};
    use ingest_core::{
        models::{PipelineRecord, RecordStatus},
        traits::RecordRepository,
    };
    use ingest_testing_utils::{wait_for, ManualClock};
    use std::time::Duration;

    fn processed(record_type: &str, year: i32, month: u32) -> PipelineRecord {
        PipelineRecord {
            id: 0,
            record_type: record_type.to_string(),
            status: RecordStatus::Processed,
            sequence_number: None,
            payload: Some("a|b".to_string()),
            processed_at: Some(Utc.with_ymd_and_hms(year, month, 15, 12, 0, 0).unwrap()),
            skip_reason: None,
        }
    }

    #[tokio::test]
    async fn test_rebuild_populates_partition() {
        let db = memory_database().await;
        let records = db.record_repository();
        records.insert(&processed("DT", 2024, 3)).await.unwrap();
        records.insert(&processed("DT", 2024, 3)).await.unwrap();
        records.insert(&processed("BH", 2024, 11)).await.unwrap();

        let clock = ManualClock::fixed();
        let rebuilder = SqliteCacheRebuilder::new(db.pool().clone(), Arc::new(clock));

        let before = rebuilder.partition_statuses().await.unwrap();
        let keys: Vec<&str> = before.iter().map(|p| p.partition_key.as_str()).collect();
        assert_eq!(keys, vec!["2024", "2025"]);
        assert!(before.iter().all(|p| p.is_missing()));

        rebuilder.start("2024").await.unwrap();
        let done = wait_for(
            || async {
                rebuilder
                    .active_jobs()
                    .await
                    .unwrap()
                    .iter()
                    .all(|j| j.status == CacheRebuildStatus::Completed)
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(done);

        let jobs = rebuilder.active_jobs().await.unwrap();
        assert_eq!(jobs[0].completed_units, 12);
        assert_eq!(rebuilder.cleanup_completed().await.unwrap(), 1);
        assert!(rebuilder.active_jobs().await.unwrap().is_empty());

        let after = rebuilder.partition_statuses().await.unwrap();
        let partition = after.iter().find(|p| p.partition_key == "2024").unwrap();
        assert_eq!(partition.entry_count, 2);
        assert!(partition.refreshed_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_partition_key_rejected() {
        let db = memory_database().await;
        let rebuilder = SqliteCacheRebuilder::new(db.pool().clone(), Arc::new(ManualClock::fixed()));

        assert!(rebuilder.start("last-year").await.is_err());
        assert!(rebuilder.active_jobs().await.unwrap().is_empty());
    }
}
