use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRebuildStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// 缓存分区重建作业，每个分区一个
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRebuildJob {
    pub partition_key: String,
    pub status: CacheRebuildStatus,
    pub current_unit: Option<String>,
    pub completed_units: u32,
    pub total_units: u32,
    pub error: Option<String>,
}

impl CacheRebuildJob {
    pub fn new(partition_key: impl Into<String>, total_units: u32) -> Self {
        Self {
            partition_key: partition_key.into(),
            status: CacheRebuildStatus::Idle,
            current_unit: None,
            completed_units: 0,
            total_units,
            error: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        self.completed_units as f64 / self.total_units as f64 * 100.0
    }

    pub fn is_running(&self) -> bool {
        self.status == CacheRebuildStatus::Running
    }
}

/// 缓存分区的当前状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePartitionStatus {
    pub partition_key: String,
    pub entry_count: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl CachePartitionStatus {
    /// 从未构建过的分区。构建后没有数据的分区不算缺失，否则会在每个冷却周期被反复重建
    pub fn is_missing(&self) -> bool {
        self.refreshed_at.is_none()
    }
}

/// 管理员触发缓存刷新的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRefreshResult {
    pub success: bool,
    pub message: String,
}

impl CacheRefreshResult {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
