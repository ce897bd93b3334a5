use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::recovery::RecoveryPhase;
use super::record::RecordTypeCounts;
use super::snapshot::{BacklogSample, PipelineSnapshot};

/// 告警级别，按严重程度递增排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 周期任务种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorTask {
    Backlog,
    HealthCheck,
    CacheStatus,
    Resource,
}

impl SupervisorTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorTask::Backlog => "backlog",
            SupervisorTask::HealthCheck => "health_check",
            SupervisorTask::CacheStatus => "cache_status",
            SupervisorTask::Resource => "resource",
        }
    }
}

impl fmt::Display for SupervisorTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 告警类型（封闭集合），每个变体携带自己的明细
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    StuckJobs {
        count: u64,
        threshold_seconds: i64,
    },
    QueueBacklog {
        queued: u64,
        threshold: u64,
    },
    HighErrorRate {
        error_jobs: u64,
        total_jobs: u64,
        rate: f64,
        threshold: f64,
    },
    SlowProcessing {
        slow_jobs: u64,
        threshold_ms: i64,
    },
    ThroughputDrop {
        previous: u64,
        current: u64,
        drop_fraction: f64,
    },
    SlowAverageProcessing {
        avg_processing_time_ms: f64,
        ceiling_ms: f64,
    },
    HealthySystem {
        total_jobs: u64,
        recent_throughput: u64,
    },
    BacklogStalled {
        count: u64,
        stalled_since: DateTime<Utc>,
        samples: Vec<BacklogSample>,
    },
    RecoveryPerformed {
        stuck_jobs_reset: u64,
        orphaned_leases_released: u64,
        unrecoverable_jobs_failed: u64,
        uploads_recovered: u64,
    },
    PhasedRecoveryCompleted {
        phases: Vec<RecoveryPhase>,
        total_processed: u64,
        total_skipped: u64,
        bulk_warnings: u64,
        bulk_errors: u64,
        duration_ms: u64,
        records_per_minute: f64,
    },
    HighMemoryUsage {
        heap_used_mb: u64,
        heap_total_mb: u64,
        usage_fraction: f64,
        threshold: f64,
    },
    HighDatastoreLatency {
        latency_ms: u64,
        threshold_ms: u64,
    },
    ConnectivityFailure {
        error: String,
    },
    StaleCache {
        partition_key: String,
        age_seconds: i64,
    },
    CacheRebuildFailed {
        partition_key: String,
        error: String,
    },
    TaskFailure {
        task: SupervisorTask,
        error: String,
    },
}

impl AlertKind {
    /// 告警类别名称，同时用作持久化的 category 字段
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::StuckJobs { .. } => "stuck_jobs",
            AlertKind::QueueBacklog { .. } => "queue_backlog",
            AlertKind::HighErrorRate { .. } => "high_error_rate",
            AlertKind::SlowProcessing { .. } => "slow_processing",
            AlertKind::ThroughputDrop { .. } => "throughput_drop",
            AlertKind::SlowAverageProcessing { .. } => "slow_average_processing",
            AlertKind::HealthySystem { .. } => "healthy_system",
            AlertKind::BacklogStalled { .. } => "backlog_stalled",
            AlertKind::RecoveryPerformed { .. } => "recovery_performed",
            AlertKind::PhasedRecoveryCompleted { .. } => "phased_recovery_completed",
            AlertKind::HighMemoryUsage { .. } => "high_memory_usage",
            AlertKind::HighDatastoreLatency { .. } => "high_datastore_latency",
            AlertKind::ConnectivityFailure { .. } => "connectivity_failure",
            AlertKind::StaleCache { .. } => "stale_cache",
            AlertKind::CacheRebuildFailed { .. } => "cache_rebuild_failed",
            AlertKind::TaskFailure { .. } => "task_failure",
        }
    }
}

/// 告警
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        level: AlertLevel,
        kind: AlertKind,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            timestamp,
        }
    }

    pub fn category(&self) -> &'static str {
        self.kind.as_str()
    }

    /// 序列化后的明细
    pub fn details(&self) -> serde_json::Value {
        serde_json::to_value(&self.kind).unwrap_or(serde_json::Value::Null)
    }

    pub fn to_row(&self) -> AlertRow {
        AlertRow {
            level: self.level,
            category: self.category().to_string(),
            message: self.message.clone(),
            details: self.details(),
            created_at: self.timestamp,
        }
    }
}

/// 告警日志中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRow {
    pub level: AlertLevel,
    pub category: String,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// 周期性指标快照行（宽表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshotRow {
    pub captured_at: DateTime<Utc>,
    pub record_counts: Vec<RecordTypeCounts>,
    pub total_pending: u64,
    pub total_processed: u64,
    pub total_skipped: u64,
    pub queued_jobs: u64,
    pub processing_jobs: u64,
    pub failed_jobs: u64,
    pub stuck_jobs: u64,
}

impl From<&PipelineSnapshot> for MetricsSnapshotRow {
    fn from(snapshot: &PipelineSnapshot) -> Self {
        Self {
            captured_at: snapshot.captured_at,
            record_counts: snapshot.record_counts.clone(),
            total_pending: snapshot.pending_backlog,
            total_processed: snapshot.total_processed_records(),
            total_skipped: snapshot.total_skipped_records(),
            queued_jobs: snapshot.queued_jobs,
            processing_jobs: snapshot.processing_jobs,
            failed_jobs: snapshot.error_jobs,
            stuck_jobs: snapshot.stuck_jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Critical > AlertLevel::Error);
        assert!(AlertLevel::Error > AlertLevel::Warning);
        assert!(AlertLevel::Warning > AlertLevel::Info);
    }

    #[test]
    fn test_alert_details_carry_type_tag() {
        let alert = Alert::new(
            AlertLevel::Critical,
            AlertKind::QueueBacklog {
                queued: 150,
                threshold: 100,
            },
            "队列积压 150 个作业",
            Utc::now(),
        );

        let row = alert.to_row();
        assert_eq!(row.category, "queue_backlog");
        assert_eq!(row.details["type"], "queue_backlog");
        assert_eq!(row.details["queued"], 150);
    }

    #[test]
    fn test_metrics_row_from_snapshot() {
        let snapshot = PipelineSnapshot {
            pending_backlog: 7,
            record_counts: vec![
                RecordTypeCounts {
                    record_type: "DT".to_string(),
                    pending: 5,
                    processed: 20,
                    skipped: 1,
                },
                RecordTypeCounts {
                    record_type: "BH".to_string(),
                    pending: 2,
                    processed: 4,
                    skipped: 0,
                },
            ],
            ..Default::default()
        };

        let row = MetricsSnapshotRow::from(&snapshot);
        assert_eq!(row.total_pending, 7);
        assert_eq!(row.total_processed, 24);
        assert_eq!(row.total_skipped, 1);
    }
}
