//! 数据仓储层接口定义
//!
//! - [`JobRepository`] - 入库作业的计数查询与条件状态转换
//! - [`RecordRepository`] - 交易记录的计数查询与批量/单条状态更新
//! - [`AlertLogSink`] - 告警与指标快照的只追加日志
//!
//! ## 并发约定
//!
//! 所有会修改共享行的操作都是条件更新（"只有仍处于预期状态才更新"），
//! 返回实际影响的行数。重复执行不会产生额外变更，多个监督器实例跨进程
//! 运行时也是安全的。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    AlertRow, Job, JobStatus, MetricsSnapshotRow, PipelineRecord, RecordTypeCounts,
};
use crate::SupervisorResult;

/// 时间窗口内已完成作业的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletedJobStats {
    pub completed: u64,
    pub avg_processing_time_ms: f64,
    pub slow: u64,
}

/// 作业仓储接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 创建作业（状态为 queued）
    async fn create(&self, job: &Job) -> SupervisorResult<Job>;

    async fn get_by_id(&self, id: i64) -> SupervisorResult<Option<Job>>;

    async fn count_all(&self) -> SupervisorResult<u64>;

    async fn count_by_status(&self, status: JobStatus) -> SupervisorResult<u64>;

    /// 处理中且开始时间早于 `started_before` 的作业数
    async fn count_stuck(&self, started_before: DateTime<Utc>) -> SupervisorResult<u64>;

    /// `since` 之后完成的作业统计，处理耗时超过 `slow_threshold_ms` 计为慢作业
    async fn completed_stats_since(
        &self,
        since: DateTime<Utc>,
        slow_threshold_ms: i64,
    ) -> SupervisorResult<CompletedJobStats>;

    /// Queued → Processing，同时获取租约。作业已被他人领取时返回 false
    async fn try_claim(&self, id: i64, owner_id: &str, now: DateTime<Utc>)
        -> SupervisorResult<bool>;

    /// Processing → Completed，只有租约持有者可以完成
    async fn complete(&self, id: i64, owner_id: &str, now: DateTime<Utc>)
        -> SupervisorResult<bool>;

    /// Processing → Queued 并记录错误，等待重试
    async fn requeue_with_error(
        &self,
        id: i64,
        owner_id: &str,
        error_text: &str,
    ) -> SupervisorResult<bool>;

    /// 将卡住的作业重置为 queued 并清除租约
    async fn reset_stuck_jobs(&self, started_before: DateTime<Utc>) -> SupervisorResult<u64>;

    /// 释放非当前实例持有且获取时间早于 `acquired_before` 的租约
    async fn release_orphaned_leases(
        &self,
        current_owner: &str,
        acquired_before: DateTime<Utc>,
    ) -> SupervisorResult<u64>;

    /// 错误信息包含任一不可恢复标记的排队作业转为终态 failed
    async fn fail_unrecoverable_jobs(&self, markers: &[String]) -> SupervisorResult<u64>;
}

/// 单条记录处理事务
#[async_trait]
pub trait RecordTransaction: Send {
    /// pending → processed，记录已不是 pending 时返回 false
    async fn mark_processed(&mut self, id: i64, now: DateTime<Utc>) -> SupervisorResult<bool>;

    async fn commit(self: Box<Self>) -> SupervisorResult<()>;

    async fn rollback(self: Box<Self>) -> SupervisorResult<()>;
}

/// 记录仓储接口
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn insert(&self, record: &PipelineRecord) -> SupervisorResult<PipelineRecord>;

    async fn get_by_id(&self, id: i64) -> SupervisorResult<Option<PipelineRecord>>;

    async fn count_pending(&self) -> SupervisorResult<u64>;

    async fn counts_by_type(&self) -> SupervisorResult<Vec<RecordTypeCounts>>;

    /// 将某类型最多 `limit` 条 pending 记录直接标记为 processed
    async fn mark_pending_processed(
        &self,
        record_type: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SupervisorResult<u64>;

    /// 按序号列出指定类型的 pending 记录
    async fn list_pending(
        &self,
        record_types: &[String],
        limit: usize,
    ) -> SupervisorResult<Vec<PipelineRecord>>;

    /// pending → skipped，并记录原因
    async fn mark_skipped(&self, id: i64, reason: &str, now: DateTime<Utc>)
        -> SupervisorResult<bool>;

    async fn begin(&self) -> SupervisorResult<Box<dyn RecordTransaction>>;
}

/// 告警与指标持久化接口（只追加）
#[async_trait]
pub trait AlertLogSink: Send + Sync {
    async fn append_alert(&self, row: &AlertRow) -> SupervisorResult<()>;

    async fn append_metrics(&self, row: &MetricsSnapshotRow) -> SupervisorResult<()>;
}
