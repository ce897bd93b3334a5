//! Test data builders for creating test entities
//!
//! Builders start from sensible defaults and expose `with_*` setters.

use chrono::{DateTime, Duration, Utc};
use ingest_core::models::{
    CachePartitionStatus, Job, JobStatus, Lease, PipelineRecord, PipelineSnapshot, RecordStatus,
    RecordTypeCounts,
};

/// Builder for creating test Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: Job::new_queued(1, Utc::now()),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.job.created_at = created_at;
        self
    }

    pub fn with_error_text(mut self, error_text: &str) -> Self {
        self.job.error_text = Some(error_text.to_string());
        self
    }

    /// 处理中，租约由 `owner_id` 在 `started_at` 获取
    pub fn processing(mut self, owner_id: &str, started_at: DateTime<Utc>) -> Self {
        self.job.status = JobStatus::Processing;
        self.job.started_at = Some(started_at);
        self.job.lease = Some(Lease::new(owner_id, started_at));
        self
    }

    pub fn completed(mut self, completed_at: DateTime<Utc>, processing_time_ms: i64) -> Self {
        self.job.status = JobStatus::Completed;
        self.job.started_at = Some(completed_at - Duration::milliseconds(processing_time_ms));
        self.job.completed_at = Some(completed_at);
        self.job.processing_time_ms = Some(processing_time_ms);
        self.job.lease = None;
        self
    }

    pub fn failed(mut self, error_text: &str) -> Self {
        self.job.status = JobStatus::Failed;
        self.job.error_text = Some(error_text.to_string());
        self.job.lease = None;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test PipelineRecord entities
pub struct RecordBuilder {
    record: PipelineRecord,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self {
            record: PipelineRecord {
                id: 1,
                record_type: "DT".to_string(),
                status: RecordStatus::Pending,
                sequence_number: Some(1),
                payload: Some("{}".to_string()),
                processed_at: None,
                skip_reason: None,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.record.id = id;
        self.record.sequence_number = Some(id);
        self
    }

    pub fn with_type(mut self, record_type: &str) -> Self {
        self.record.record_type = record_type.to_string();
        self
    }

    pub fn with_sequence(mut self, sequence_number: Option<i64>) -> Self {
        self.record.sequence_number = sequence_number;
        self
    }

    pub fn with_payload(mut self, payload: Option<&str>) -> Self {
        self.record.payload = payload.map(str::to_string);
        self
    }

    pub fn processed(mut self, processed_at: DateTime<Utc>) -> Self {
        self.record.status = RecordStatus::Processed;
        self.record.processed_at = Some(processed_at);
        self
    }

    pub fn skipped(mut self, reason: &str) -> Self {
        self.record.status = RecordStatus::Skipped;
        self.record.skip_reason = Some(reason.to_string());
        self
    }

    pub fn build(self) -> PipelineRecord {
        self.record
    }

    /// 生成 `count` 条连续 id 的 pending 记录
    pub fn pending_batch(record_type: &str, first_id: i64, count: usize) -> Vec<PipelineRecord> {
        (0..count as i64)
            .map(|offset| {
                RecordBuilder::new()
                    .with_id(first_id + offset)
                    .with_type(record_type)
                    .build()
            })
            .collect()
    }
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for PipelineSnapshot, used by analyzer tests
pub struct SnapshotBuilder {
    snapshot: PipelineSnapshot,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self {
            snapshot: PipelineSnapshot {
                captured_at: Utc::now(),
                ..Default::default()
            },
        }
    }

    pub fn with_total_jobs(mut self, total: u64) -> Self {
        self.snapshot.total_jobs = total;
        self
    }

    pub fn with_queued(mut self, queued: u64) -> Self {
        self.snapshot.queued_jobs = queued;
        self
    }

    pub fn with_processing(mut self, processing: u64) -> Self {
        self.snapshot.processing_jobs = processing;
        self
    }

    pub fn with_completed(mut self, completed: u64) -> Self {
        self.snapshot.completed_jobs = completed;
        self
    }

    pub fn with_stuck(mut self, stuck: u64) -> Self {
        self.snapshot.stuck_jobs = stuck;
        self
    }

    pub fn with_error_jobs(mut self, error_jobs: u64) -> Self {
        self.snapshot.error_jobs = error_jobs;
        self
    }

    pub fn with_slow_jobs(mut self, slow_jobs: u64) -> Self {
        self.snapshot.slow_jobs = slow_jobs;
        self
    }

    pub fn with_avg_processing_time_ms(mut self, avg: f64) -> Self {
        self.snapshot.avg_processing_time_ms = avg;
        self
    }

    pub fn with_throughput(mut self, throughput: u64) -> Self {
        self.snapshot.recent_throughput = throughput;
        self
    }

    pub fn with_pending_backlog(mut self, pending: u64) -> Self {
        self.snapshot.pending_backlog = pending;
        self
    }

    pub fn with_record_counts(mut self, counts: Vec<RecordTypeCounts>) -> Self {
        self.snapshot.pending_backlog = counts.iter().map(|c| c.pending).sum();
        self.snapshot.record_counts = counts;
        self
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.snapshot.captured_at = at;
        self
    }

    pub fn build(self) -> PipelineSnapshot {
        self.snapshot
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 缓存分区状态
pub fn partition(key: &str, entry_count: u64, refreshed_at: Option<DateTime<Utc>>) -> CachePartitionStatus {
    CachePartitionStatus {
        partition_key: key.to_string(),
        entry_count,
        refreshed_at,
    }
}
