//! 监督器调用的外部协作者接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    BulkOutcome, CachePartitionStatus, CacheRebuildJob, OrphanedUpload, PipelineRecord,
};
use crate::SupervisorResult;

/// 单条记录处理器（第三层恢复使用）
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &PipelineRecord) -> SupervisorResult<()>;
}

/// 批量处理器（第四层恢复使用）
#[async_trait]
pub trait BulkProcessor: Send + Sync {
    /// 处理给定类型的全部 pending 记录
    async fn process_pending(
        &self,
        record_types: &[String],
        batch_size_hint: usize,
    ) -> SupervisorResult<BulkOutcome>;
}

/// 孤儿上传查找与恢复
#[async_trait]
pub trait UploadRecovery: Send + Sync {
    async fn find_orphaned_uploads(
        &self,
        stale_before: DateTime<Utc>,
    ) -> SupervisorResult<Vec<OrphanedUpload>>;

    async fn recover(&self, ids: &[String]) -> SupervisorResult<u64>;
}

/// 派生缓存重建
#[async_trait]
pub trait CacheRebuilder: Send + Sync {
    async fn start(&self, partition_key: &str) -> SupervisorResult<()>;

    /// 当前跟踪的重建作业（含尚未清理的已完成/失败作业）
    async fn active_jobs(&self) -> SupervisorResult<Vec<CacheRebuildJob>>;

    /// 清理已结束的作业，返回清理数量
    async fn cleanup_completed(&self) -> SupervisorResult<u64>;

    /// 所有应当存在的分区及其状态
    async fn partition_statuses(&self) -> SupervisorResult<Vec<CachePartitionStatus>>;
}

/// 暂停开关，运维人员用来手动接管
#[async_trait]
pub trait PauseFlag: Send + Sync {
    async fn is_paused(&self) -> SupervisorResult<bool>;
}

/// 缓存重建最近一次触发时间的共享存储
///
/// 常驻进程和一次性的管理命令通过它共用同一个冷却窗口。
#[async_trait]
pub trait RebuildCooldownStore: Send + Sync {
    async fn last_triggered_at(&self) -> SupervisorResult<Option<DateTime<Utc>>>;

    /// 比较并交换：当前值等于 `expected` 时写入 `value`，返回是否写入
    async fn swap_triggered_at(
        &self,
        expected: Option<DateTime<Utc>>,
        value: Option<DateTime<Utc>>,
    ) -> SupervisorResult<bool>;
}

/// 数据存储往返探测
#[async_trait]
pub trait DatastoreProbe: Send + Sync {
    /// 执行一条空操作查询
    async fn ping(&self) -> SupervisorResult<()>;
}

/// 进程内存使用情况
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }

    pub fn used_mb(&self) -> u64 {
        self.used_bytes / (1024 * 1024)
    }

    pub fn total_mb(&self) -> u64 {
        self.total_bytes / (1024 * 1024)
    }
}

/// 内存探测
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> SupervisorResult<MemoryUsage>;
}
