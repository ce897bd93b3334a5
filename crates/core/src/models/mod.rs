//! # 数据模型
//!
//! 定义处理监督器使用的核心数据结构。
//!
//! ## 核心模型
//!
//! - [`Job`] / [`JobStatus`] / [`Lease`] - 入库作业及其租约
//! - [`PipelineRecord`] / [`RecordStatus`] - 解析后的交易记录
//! - [`PipelineSnapshot`] / [`BacklogSample`] - 流水线时间点快照与积压采样
//! - [`Alert`] / [`AlertKind`] - 告警（封闭的类型集合）
//! - [`RecoveryPhase`] - 分阶段恢复的单阶段结果
//! - [`CacheRebuildJob`] - 缓存分区重建作业
//!
//! ## 作业状态流转
//! ```text
//! Queued → Processing → Completed
//!            ↓
//!          Failed
//! ```
//!
//! 所有时间字段使用 `DateTime<Utc>`。

pub mod alert;
pub mod cache;
pub mod job;
pub mod record;
pub mod recovery;
pub mod snapshot;

pub use alert::*;
pub use cache::*;
pub use job::*;
pub use record::*;
pub use recovery::*;
pub use snapshot::*;
