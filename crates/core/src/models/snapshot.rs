use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::RecordTypeCounts;

/// 流水线时间点快照
///
/// 每个周期重新计算，只追加到历史，不作为可变状态持久化。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub total_jobs: u64,
    pub queued_jobs: u64,
    pub processing_jobs: u64,
    pub completed_jobs: u64,
    pub stuck_jobs: u64,
    pub error_jobs: u64,
    pub avg_processing_time_ms: f64,
    pub slow_jobs: u64,
    pub recent_throughput: u64,
    pub pending_backlog: u64,
    pub backlog_delta: i64,
    pub record_counts: Vec<RecordTypeCounts>,
    pub captured_at: DateTime<Utc>,
}

impl PipelineSnapshot {
    /// 错误率（失败作业 / 全部作业）
    pub fn error_rate(&self) -> Option<f64> {
        if self.total_jobs == 0 {
            None
        } else {
            Some(self.error_jobs as f64 / self.total_jobs as f64)
        }
    }

    pub fn total_processed_records(&self) -> u64 {
        self.record_counts.iter().map(|c| c.processed).sum()
    }

    pub fn total_skipped_records(&self) -> u64 {
        self.record_counts.iter().map(|c| c.skipped).sum()
    }
}

/// 积压采样
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogSample {
    pub count: u64,
    pub timestamp: DateTime<Utc>,
}

/// 上传队列状态（对应上传客户端的 batch-status 查询）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active: u64,
    pub waiting: u64,
    pub completed: u64,
    pub failed: u64,
    pub max_concurrent: u64,
    pub is_busy: bool,
}

impl QueueStatus {
    pub fn from_snapshot(snapshot: &PipelineSnapshot, max_concurrent: u64) -> Self {
        Self {
            active: snapshot.processing_jobs,
            waiting: snapshot.queued_jobs,
            completed: snapshot.completed_jobs,
            failed: snapshot.error_jobs,
            max_concurrent,
            is_busy: snapshot.processing_jobs >= max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate() {
        let mut snapshot = PipelineSnapshot::default();
        assert_eq!(snapshot.error_rate(), None);

        snapshot.total_jobs = 200;
        snapshot.error_jobs = 50;
        assert_eq!(snapshot.error_rate(), Some(0.25));
    }

    #[test]
    fn test_queue_status_busy() {
        let snapshot = PipelineSnapshot {
            processing_jobs: 5,
            queued_jobs: 12,
            ..Default::default()
        };
        let status = QueueStatus::from_snapshot(&snapshot, 5);
        assert!(status.is_busy);
        assert_eq!(status.waiting, 12);

        let status = QueueStatus::from_snapshot(&snapshot, 8);
        assert!(!status.is_busy);
    }
}
