use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// 监督器配置（运行时只读）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// 当前实例ID，用于区分自己持有的租约
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// 上传队列最大并发，用于队列状态的繁忙判定
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: u64,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub alerts: AlertThresholds,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub resource: ResourceThresholds,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            intervals: IntervalConfig::default(),
            backlog: BacklogConfig::default(),
            alerts: AlertThresholds::default(),
            recovery: RecoveryConfig::default(),
            resource: ResourceThresholds::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_max_concurrent_uploads() -> u64 {
    5
}

/// 主机名加随机后缀
pub fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

impl SupervisorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instance_id.is_empty() {
            return Err(anyhow::anyhow!("实例ID不能为空"));
        }
        self.intervals.validate()?;
        self.backlog.validate()?;
        self.alerts.validate()?;
        self.recovery.validate()?;
        self.resource.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

/// 各周期任务的间隔
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    /// 积压采样、租约清理、指标记录
    pub backlog_seconds: u64,
    /// 完整健康检查与恢复
    pub health_check_seconds: u64,
    /// 缓存状态检查
    pub cache_check_seconds: u64,
    /// 资源监控
    pub resource_check_seconds: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            backlog_seconds: 30,
            health_check_seconds: 120,
            cache_check_seconds: 300,
            resource_check_seconds: 60,
        }
    }
}

impl IntervalConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backlog_seconds == 0
            || self.health_check_seconds == 0
            || self.cache_check_seconds == 0
            || self.resource_check_seconds == 0
        {
            return Err(anyhow::anyhow!("任务间隔必须大于0"));
        }
        Ok(())
    }
}

/// 积压跟踪配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    /// 环形缓冲区容量（30秒采样时约10分钟）
    pub history_capacity: usize,
    /// 判定停滞所需的最少采样数
    pub min_samples: usize,
    /// 停滞判定窗口（秒）
    pub stall_threshold_seconds: i64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            history_capacity: 20,
            min_samples: 4,
            stall_threshold_seconds: 120,
        }
    }
}

impl BacklogConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::seconds(self.stall_threshold_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.history_capacity == 0 {
            return Err(anyhow::anyhow!("积压历史容量必须大于0"));
        }
        if self.min_samples == 0 || self.min_samples > self.history_capacity {
            return Err(anyhow::anyhow!(
                "最少采样数必须在 1 到 {} 之间",
                self.history_capacity
            ));
        }
        if self.stall_threshold_seconds <= 0 {
            return Err(anyhow::anyhow!("停滞判定窗口必须大于0"));
        }
        Ok(())
    }
}

/// 告警阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub queue_warning: u64,
    pub queue_critical: u64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    /// 处理中超过该时间视为卡住（秒）
    pub stuck_job_seconds: i64,
    /// 单个作业处理耗时超过该值视为慢作业（毫秒）
    pub slow_job_ms: i64,
    /// 吞吐量相对上次下降超过该比例时告警
    pub throughput_drop_fraction: f64,
    /// 平均处理耗时上限（毫秒）
    pub avg_processing_ceiling_ms: f64,
    /// 吞吐量统计窗口（秒）
    pub throughput_window_seconds: i64,
    /// 内存中告警列表容量
    pub history_limit: usize,
}

/// 内存中告警列表容量上限
pub const MAX_ALERT_HISTORY: usize = 100;

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_warning: 50,
            queue_critical: 100,
            error_rate_warning: 0.10,
            error_rate_critical: 0.25,
            stuck_job_seconds: 600,
            slow_job_ms: 300_000,
            throughput_drop_fraction: 0.5,
            avg_processing_ceiling_ms: 60_000.0,
            throughput_window_seconds: 3600,
            history_limit: MAX_ALERT_HISTORY,
        }
    }
}

impl AlertThresholds {
    pub fn stuck_threshold(&self) -> Duration {
        Duration::seconds(self.stuck_job_seconds)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::seconds(self.throughput_window_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_warning > self.queue_critical {
            return Err(anyhow::anyhow!("队列警告阈值不能大于严重阈值"));
        }
        if !(0.0..=1.0).contains(&self.error_rate_warning)
            || !(0.0..=1.0).contains(&self.error_rate_critical)
            || self.error_rate_warning > self.error_rate_critical
        {
            return Err(anyhow::anyhow!("错误率阈值无效"));
        }
        if !(0.0..=1.0).contains(&self.throughput_drop_fraction) {
            return Err(anyhow::anyhow!("吞吐量下降比例必须在0到1之间"));
        }
        if self.stuck_job_seconds <= 0 || self.throughput_window_seconds <= 0 {
            return Err(anyhow::anyhow!("时间阈值必须大于0"));
        }
        if self.history_limit == 0 || self.history_limit > MAX_ALERT_HISTORY {
            return Err(anyhow::anyhow!(
                "告警历史容量必须在1到{}之间",
                MAX_ALERT_HISTORY
            ));
        }
        Ok(())
    }
}

/// 恢复编排配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// 租约超过该时间且持有者不是当前实例视为孤儿（秒）
    pub orphaned_lease_seconds: i64,
    /// 上传停留在中间状态超过该时间视为孤儿（秒）
    pub orphaned_upload_seconds: i64,
    /// 错误信息中表示不可恢复输入的标记
    pub unrecoverable_markers: Vec<String>,
    /// pending 积压超过该值才执行分阶段恢复
    pub emergency_backlog_threshold: u64,
    /// 快速路径的批大小
    pub batch_size: usize,
    /// 快速路径每轮每个类型的最大批次数
    pub max_batches_per_pass: usize,
    /// 积压仍然很大时是否执行第二轮快速路径
    pub second_pass_enabled: bool,
    /// 第一、二层：可直接批量标记为 processed 的记录类型
    pub fast_path_types: Vec<String>,
    /// 第三层：需要逐条处理的记录类型
    pub per_record_types: Vec<String>,
    /// 第三层单次运行的最大记录数
    pub per_record_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            orphaned_lease_seconds: 300,
            orphaned_upload_seconds: 1800,
            unrecoverable_markers: vec![
                "invalid file format".to_string(),
                "unrecoverable".to_string(),
                "corrupt".to_string(),
                "malformed header".to_string(),
            ],
            emergency_backlog_threshold: 10_000,
            batch_size: 1000,
            max_batches_per_pass: 10,
            second_pass_enabled: true,
            fast_path_types: vec!["DT".to_string(), "BH".to_string()],
            per_record_types: vec!["P1".to_string(), "P2".to_string()],
            per_record_limit: 500,
        }
    }
}

impl RecoveryConfig {
    pub fn orphaned_lease_threshold(&self) -> Duration {
        Duration::seconds(self.orphaned_lease_seconds)
    }

    pub fn orphaned_upload_threshold(&self) -> Duration {
        Duration::seconds(self.orphaned_upload_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.max_batches_per_pass == 0 {
            return Err(anyhow::anyhow!("批大小和批次数必须大于0"));
        }
        if self.orphaned_lease_seconds <= 0 {
            return Err(anyhow::anyhow!("孤儿租约阈值必须大于0"));
        }
        if let Some(dup) = self
            .fast_path_types
            .iter()
            .find(|t| self.per_record_types.contains(t))
        {
            return Err(anyhow::anyhow!(
                "记录类型 {dup} 不能同时属于快速路径和逐条处理"
            ));
        }
        Ok(())
    }
}

/// 资源监控阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub memory_warning_fraction: f64,
    pub memory_critical_fraction: f64,
    pub latency_warning_ms: u64,
    pub latency_critical_ms: u64,
    /// 数据存储探测的显式截止时间（毫秒）
    pub datastore_deadline_ms: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_warning_fraction: 0.80,
            memory_critical_fraction: 0.90,
            latency_warning_ms: 500,
            latency_critical_ms: 2000,
            datastore_deadline_ms: 5000,
        }
    }
}

impl ResourceThresholds {
    pub fn datastore_deadline(&self) -> StdDuration {
        StdDuration::from_millis(self.datastore_deadline_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.memory_warning_fraction > self.memory_critical_fraction {
            return Err(anyhow::anyhow!("内存警告阈值不能大于严重阈值"));
        }
        if self.latency_warning_ms > self.latency_critical_ms {
            return Err(anyhow::anyhow!("延迟警告阈值不能大于严重阈值"));
        }
        if self.datastore_deadline_ms == 0 {
            return Err(anyhow::anyhow!("探测截止时间必须大于0"));
        }
        Ok(())
    }
}

/// 缓存重建配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 全局冷却时间（秒），对自动和管理员触发同时生效
    pub rebuild_cooldown_seconds: i64,
    /// 分区刷新时间超过该值视为过期（秒）
    pub stale_after_seconds: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rebuild_cooldown_seconds: 900,
            stale_after_seconds: 86_400,
        }
    }
}

impl CacheConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.rebuild_cooldown_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rebuild_cooldown_seconds < 0 || self.stale_after_seconds <= 0 {
            return Err(anyhow::anyhow!("缓存时间配置无效"));
        }
        Ok(())
    }
}
