use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use ingest_core::{
    config::AlertThresholds,
    models::{JobStatus, PipelineSnapshot},
    traits::{CompletedJobStats, JobRepository, RecordRepository},
    Clock, SupervisorResult,
};

/// 指标采集器
///
/// 只读查询作业和记录仓储，生成流水线快照。单个子查询失败时记录警告
/// 并按 0 处理，快照总能生成。
pub struct MetricsCollector {
    job_repo: Arc<dyn JobRepository>,
    record_repo: Arc<dyn RecordRepository>,
    clock: Arc<dyn Clock>,
    thresholds: AlertThresholds,
    previous_backlog: Mutex<Option<u64>>,
}

impl MetricsCollector {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        record_repo: Arc<dyn RecordRepository>,
        clock: Arc<dyn Clock>,
        thresholds: AlertThresholds,
    ) -> Self {
        Self {
            job_repo,
            record_repo,
            clock,
            thresholds,
            previous_backlog: Mutex::new(None),
        }
    }

    pub async fn collect(&self) -> PipelineSnapshot {
        let now = self.clock.now();
        let stuck_cutoff = now - self.thresholds.stuck_threshold();
        let window_start = now - self.thresholds.throughput_window();

        let total_jobs = or_zero("total_jobs", self.job_repo.count_all().await);
        let queued_jobs = or_zero(
            "queued_jobs",
            self.job_repo.count_by_status(JobStatus::Queued).await,
        );
        let processing_jobs = or_zero(
            "processing_jobs",
            self.job_repo.count_by_status(JobStatus::Processing).await,
        );
        let completed_jobs = or_zero(
            "completed_jobs",
            self.job_repo.count_by_status(JobStatus::Completed).await,
        );
        let error_jobs = or_zero(
            "error_jobs",
            self.job_repo.count_by_status(JobStatus::Failed).await,
        );
        let stuck_jobs = or_zero("stuck_jobs", self.job_repo.count_stuck(stuck_cutoff).await);
        let completed: CompletedJobStats = or_zero(
            "completed_stats",
            self.job_repo
                .completed_stats_since(window_start, self.thresholds.slow_job_ms)
                .await,
        );
        let pending_backlog = or_zero("pending_backlog", self.record_repo.count_pending().await);
        let record_counts = or_zero("record_counts", self.record_repo.counts_by_type().await);

        let backlog_delta = {
            let mut previous = match self.previous_backlog.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let delta = previous
                .map(|p| pending_backlog as i64 - p as i64)
                .unwrap_or(0);
            *previous = Some(pending_backlog);
            delta
        };

        let snapshot = PipelineSnapshot {
            total_jobs,
            queued_jobs,
            processing_jobs,
            completed_jobs,
            stuck_jobs,
            error_jobs,
            avg_processing_time_ms: completed.avg_processing_time_ms,
            slow_jobs: completed.slow,
            recent_throughput: completed.completed,
            pending_backlog,
            backlog_delta,
            record_counts,
            captured_at: now,
        };

        publish_gauges(&snapshot);
        debug!(
            "采集流水线快照: queued={} processing={} stuck={} pending={} delta={}",
            snapshot.queued_jobs,
            snapshot.processing_jobs,
            snapshot.stuck_jobs,
            snapshot.pending_backlog,
            snapshot.backlog_delta
        );

        snapshot
    }
}

fn or_zero<T: Default>(name: &str, result: SupervisorResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("指标查询 {} 失败，按 0 处理: {}", name, e);
            T::default()
        }
    }
}

fn publish_gauges(snapshot: &PipelineSnapshot) {
    metrics::gauge!("pipeline_jobs_queued").set(snapshot.queued_jobs as f64);
    metrics::gauge!("pipeline_jobs_processing").set(snapshot.processing_jobs as f64);
    metrics::gauge!("pipeline_jobs_stuck").set(snapshot.stuck_jobs as f64);
    metrics::gauge!("pipeline_jobs_failed").set(snapshot.error_jobs as f64);
    metrics::gauge!("pipeline_pending_backlog").set(snapshot.pending_backlog as f64);
    metrics::gauge!("pipeline_recent_throughput").set(snapshot.recent_throughput as f64);
    metrics::gauge!("pipeline_avg_processing_time_ms").set(snapshot.avg_processing_time_ms);
}
