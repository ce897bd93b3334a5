use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{
    models::{Job, JobStatus, Lease},
    traits::{CompletedJobStats, JobRepository},
    SupervisorError, SupervisorResult,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &SqliteRow) -> SupervisorResult<Job> {
        let lease_owner: Option<String> = row.try_get("lease_owner")?;
        let lease_acquired_at: Option<DateTime<Utc>> = row.try_get("lease_acquired_at")?;
        let lease = match (lease_owner, lease_acquired_at) {
            (Some(owner_id), Some(acquired_at)) => Some(Lease::new(owner_id, acquired_at)),
            _ => None,
        };

        Ok(Job {
            id: row.try_get("id")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            lease,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            error_text: row.try_get("error_text")?,
            requires_resubmission: row.try_get("requires_resubmission")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create(&self, job: &Job) -> SupervisorResult<Job> {
        let result = sqlx::query(
            "INSERT INTO jobs (status, error_text, requires_resubmission, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(JobStatus::Queued.as_str())
        .bind(&job.error_text)
        .bind(job.requires_resubmission)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("创建作业 {}", id);
        self.get_by_id(id)
            .await?
            .ok_or(SupervisorError::JobNotFound { id })
    }

    async fn get_by_id(&self, id: i64) -> SupervisorResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn count_all(&self) -> SupervisorResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        MappingHelpers::count(&row, "total")
    }

    async fn count_by_status(&self, status: JobStatus) -> SupervisorResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        MappingHelpers::count(&row, "total")
    }

    async fn count_stuck(&self, started_before: DateTime<Utc>) -> SupervisorResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM jobs WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < ?",
        )
        .bind(started_before)
        .fetch_one(&self.pool)
        .await?;
        MappingHelpers::count(&row, "total")
    }

    async fn completed_stats_since(
        &self,
        since: DateTime<Utc>,
        slow_threshold_ms: i64,
    ) -> SupervisorResult<CompletedJobStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS completed,
                CAST(AVG(processing_time_ms) AS REAL) AS avg_ms,
                SUM(CASE WHEN processing_time_ms > ? THEN 1 ELSE 0 END) AS slow
            FROM jobs
            WHERE status = 'completed' AND completed_at >= ?
            "#,
        )
        .bind(slow_threshold_ms)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let avg: Option<f64> = row.try_get("avg_ms")?;
        Ok(CompletedJobStats {
            completed: MappingHelpers::count(&row, "completed")?,
            avg_processing_time_ms: avg.unwrap_or(0.0),
            slow: MappingHelpers::count(&row, "slow")?,
        })
    }

    async fn try_claim(
        &self,
        id: i64,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> SupervisorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', lease_owner = ?, lease_acquired_at = ?, started_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(owner_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: i64,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> SupervisorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                lease_owner = NULL,
                lease_acquired_at = NULL,
                completed_at = ?,
                processing_time_ms = CAST((julianday(?) - julianday(started_at)) * 86400000 AS INTEGER)
            WHERE id = ? AND status = 'processing' AND lease_owner = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_with_error(
        &self,
        id: i64,
        owner_id: &str,
        error_text: &str,
    ) -> SupervisorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', lease_owner = NULL, lease_acquired_at = NULL,
                started_at = NULL, error_text = ?
            WHERE id = ? AND status = 'processing' AND lease_owner = ?
            "#,
        )
        .bind(error_text)
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn reset_stuck_jobs(&self, started_before: DateTime<Utc>) -> SupervisorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', lease_owner = NULL, lease_acquired_at = NULL, started_at = NULL
            WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < ?
            "#,
        )
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn release_orphaned_leases(
        &self,
        current_owner: &str,
        acquired_before: DateTime<Utc>,
    ) -> SupervisorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', lease_owner = NULL, lease_acquired_at = NULL, started_at = NULL
            WHERE status = 'processing'
              AND lease_owner IS NOT NULL
              AND lease_owner <> ?
              AND lease_acquired_at < ?
            "#,
        )
        .bind(current_owner)
        .bind(acquired_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_unrecoverable_jobs(&self, markers: &[String]) -> SupervisorResult<u64> {
        let mut affected = 0;
        for marker in markers.iter().filter(|m| !m.is_empty()) {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed', requires_resubmission = 1
                WHERE status = 'queued'
                  AND error_text IS NOT NULL
                  AND instr(lower(error_text), lower(?)) > 0
                "#,
            )
            .bind(marker)
            .execute(&self.pool)
            .await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_database;
    use chrono::{Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    async fn repo_with_jobs(count: usize) -> (SqliteJobRepository, Vec<Job>) {
        let db = memory_database().await;
        let repo = db.job_repository();
        let mut jobs = Vec::new();
        for _ in 0..count {
            jobs.push(repo.create(&Job::new_queued(0, base_time())).await.unwrap());
        }
        (repo, jobs)
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let (repo, jobs) = repo_with_jobs(1).await;
        let id = jobs[0].id;
        let now = base_time();

        assert!(repo.try_claim(id, "watchdog-a", now).await.unwrap());
        assert!(!repo.try_claim(id, "watchdog-b", now).await.unwrap());

        let job = repo.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.lease.unwrap().owner_id, "watchdog-a");
    }

    #[tokio::test]
    async fn test_complete_requires_lease_owner_and_records_duration() {
        let (repo, jobs) = repo_with_jobs(1).await;
        let id = jobs[0].id;
        let start = base_time();
        repo.try_claim(id, "watchdog-a", start).await.unwrap();

        let end = start + Duration::seconds(90);
        assert!(!repo.complete(id, "watchdog-b", end).await.unwrap());
        assert!(repo.complete(id, "watchdog-a", end).await.unwrap());

        let job = repo.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.lease.is_none());
        let ms = job.processing_time_ms.unwrap();
        assert!((89_990..=90_010).contains(&ms), "processing_time_ms = {ms}");

        let stats = repo
            .completed_stats_since(start, 60_000)
            .await
            .unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.slow, 1);
    }

    #[tokio::test]
    async fn test_stuck_reset_and_orphan_release() {
        let (repo, jobs) = repo_with_jobs(3).await;
        let now = base_time() + Duration::hours(1);

        repo.try_claim(jobs[0].id, "watchdog-b", now - Duration::minutes(30))
            .await
            .unwrap();
        repo.try_claim(jobs[1].id, "watchdog-a", now - Duration::minutes(8))
            .await
            .unwrap();
        repo.try_claim(jobs[2].id, "watchdog-b", now - Duration::minutes(8))
            .await
            .unwrap();

        let stuck_cutoff = now - Duration::minutes(10);
        assert_eq!(repo.count_stuck(stuck_cutoff).await.unwrap(), 1);
        assert_eq!(repo.reset_stuck_jobs(stuck_cutoff).await.unwrap(), 1);
        assert_eq!(repo.reset_stuck_jobs(stuck_cutoff).await.unwrap(), 0);

        let lease_cutoff = now - Duration::minutes(5);
        assert_eq!(
            repo.release_orphaned_leases("watchdog-a", lease_cutoff)
                .await
                .unwrap(),
            1
        );
        let own = repo.get_by_id(jobs[1].id).await.unwrap().unwrap();
        assert_eq!(own.status, JobStatus::Processing);
        let released = repo.get_by_id(jobs[2].id).await.unwrap().unwrap();
        assert_eq!(released.status, JobStatus::Queued);
        assert!(released.started_at.is_none());

        assert_eq!(repo.count_by_status(JobStatus::Queued).await.unwrap(), 2);
        assert_eq!(repo.count_all().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unrecoverable_markers_match_case_insensitively() {
        let (repo, jobs) = repo_with_jobs(2).await;
        let now = base_time();
        repo.try_claim(jobs[0].id, "watchdog-a", now).await.unwrap();
        repo.requeue_with_error(jobs[0].id, "watchdog-a", "Invalid File Format near line 3")
            .await
            .unwrap();
        repo.try_claim(jobs[1].id, "watchdog-a", now).await.unwrap();
        repo.requeue_with_error(jobs[1].id, "watchdog-a", "database is locked")
            .await
            .unwrap();

        let markers = vec!["invalid file format".to_string()];
        assert_eq!(repo.fail_unrecoverable_jobs(&markers).await.unwrap(), 1);
        assert_eq!(repo.fail_unrecoverable_jobs(&markers).await.unwrap(), 0);

        let failed = repo.get_by_id(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.requires_resubmission);
        let retried = repo.get_by_id(jobs[1].id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
    }
}
