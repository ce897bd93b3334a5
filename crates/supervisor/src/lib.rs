//! 批量入库流水线的处理监督器
//!
//! 数据在每个周期内单向流动：
//!
//! ```text
//! 调度 → 指标采集 → 积压跟踪 / 告警分析 → 恢复编排（按需） → 持久化
//! ```
//!
//! 资源监控和缓存重建协调在各自的定时器上运行，写入同一个持久化日志。

pub mod alert_analyzer;
pub mod alert_store;
pub mod backlog_tracker;
pub mod cache_coordinator;
pub mod metrics_collector;
pub mod phased_recovery;
pub mod recovery_service;
pub mod resource_monitor;
pub mod supervisor;

pub use alert_analyzer::{requires_recovery, AlertAnalyzer};
pub use alert_store::AlertStore;
pub use backlog_tracker::{BacklogObservation, BacklogTracker};
pub use cache_coordinator::CacheCoordinator;
pub use metrics_collector::MetricsCollector;
pub use phased_recovery::{PhasedRecovery, PhasedRecoveryReport};
pub use recovery_service::{RecoveryOrchestrator, RecoveryOutcome, RecoveryReport};
pub use resource_monitor::ResourceMonitor;
pub use supervisor::{ProcessingSupervisor, SupervisorDeps, SupervisorStatus};
