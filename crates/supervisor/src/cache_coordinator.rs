use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use ingest_core::{
    config::CacheConfig,
    models::{Alert, AlertKind, AlertLevel, CacheRebuildStatus, CacheRefreshResult},
    traits::{CacheRebuilder, PauseFlag, RebuildCooldownStore},
    Clock, SupervisorResult,
};

/// 缓存重建协调器
///
/// 自动重建和管理员请求共用同一个全局冷却时间，冷却时间保存在数据存储里，
/// 跨进程生效。只有从未构建过的分区会被自动重建，过期的分区只告警，
/// 需要管理员显式触发刷新。
pub struct CacheCoordinator {
    rebuilder: Arc<dyn CacheRebuilder>,
    pause_flag: Arc<dyn PauseFlag>,
    cooldown_store: Arc<dyn RebuildCooldownStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    /// 进程内串行化检查和启动，跨进程靠存储的条件更新
    trigger_lock: Mutex<()>,
}

impl CacheCoordinator {
    pub fn new(
        rebuilder: Arc<dyn CacheRebuilder>,
        pause_flag: Arc<dyn PauseFlag>,
        cooldown_store: Arc<dyn RebuildCooldownStore>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            rebuilder,
            pause_flag,
            cooldown_store,
            clock,
            config,
            trigger_lock: Mutex::new(()),
        }
    }

    /// 管理员请求重建分区
    pub async fn request_rebuild(&self, partition_key: &str, requested_by: &str) -> CacheRefreshResult {
        info!("{} 请求重建缓存分区 {}", requested_by, partition_key);
        let result = self.try_start(partition_key).await;
        if !result.success {
            warn!(
                "拒绝 {} 的缓存重建请求 ({}): {}",
                requested_by, partition_key, result.message
            );
        }
        result
    }

    async fn try_start(&self, partition_key: &str) -> CacheRefreshResult {
        let _guard = self.trigger_lock.lock().await;
        let now = self.clock.now();

        let last_trigger = match self.cooldown_store.last_triggered_at().await {
            Ok(last) => last,
            Err(e) => {
                return CacheRefreshResult::rejected(format!("读取冷却时间失败: {}", e));
            }
        };

        if let Some(last) = last_trigger {
            let remaining = self.config.cooldown() - (now - last);
            if remaining > chrono::Duration::zero() {
                let minutes = (remaining.num_seconds() + 59) / 60;
                return CacheRefreshResult::rejected(format!(
                    "缓存重建冷却中，剩余约 {} 分钟",
                    minutes
                ));
            }
        }

        match self.rebuilder.active_jobs().await {
            Ok(jobs) => {
                if jobs
                    .iter()
                    .any(|j| j.partition_key == partition_key && j.is_running())
                {
                    return CacheRefreshResult::rejected(format!(
                        "分区 {} 正在重建",
                        partition_key
                    ));
                }
            }
            Err(e) => {
                return CacheRefreshResult::rejected(format!("查询重建作业失败: {}", e));
            }
        }

        // 先占用冷却窗口再启动，另一个进程在读取之后抢先触发时这里会失败
        match self.cooldown_store.swap_triggered_at(last_trigger, Some(now)).await {
            Ok(true) => {}
            Ok(false) => {
                return CacheRefreshResult::rejected("其他实例刚刚触发了缓存重建");
            }
            Err(e) => {
                return CacheRefreshResult::rejected(format!("记录冷却时间失败: {}", e));
            }
        }

        match self.rebuilder.start(partition_key).await {
            Ok(()) => {
                metrics::counter!("supervisor_cache_rebuilds_started_total").increment(1);
                info!("缓存分区 {} 开始重建", partition_key);
                CacheRefreshResult::accepted(format!("分区 {} 缓存重建已开始", partition_key))
            }
            Err(e) => {
                error!("启动缓存分区 {} 重建失败: {}", partition_key, e);
                // 启动失败不占用冷却时间
                if let Err(restore_err) = self
                    .cooldown_store
                    .swap_triggered_at(Some(now), last_trigger)
                    .await
                {
                    warn!("恢复缓存重建冷却时间失败: {}", restore_err);
                }
                CacheRefreshResult::rejected(format!("启动缓存重建失败: {}", e))
            }
        }
    }

    /// 周期性检查：报告作业进度并清理已结束作业，重建缺失分区，告警过期分区
    pub async fn check(&self) -> SupervisorResult<Vec<Alert>> {
        let now = self.clock.now();
        let mut alerts = Vec::new();

        for job in self.rebuilder.active_jobs().await? {
            match job.status {
                CacheRebuildStatus::Running => info!(
                    "缓存分区 {} 重建中: {}/{} ({:.0}%)，当前单元 {}",
                    job.partition_key,
                    job.completed_units,
                    job.total_units,
                    job.progress_percent(),
                    job.current_unit.as_deref().unwrap_or("-")
                ),
                CacheRebuildStatus::Failed => {
                    let error = job.error.clone().unwrap_or_else(|| "未知错误".to_string());
                    alerts.push(Alert::new(
                        AlertLevel::Error,
                        AlertKind::CacheRebuildFailed {
                            partition_key: job.partition_key.clone(),
                            error: error.clone(),
                        },
                        format!("缓存分区 {} 重建失败: {}", job.partition_key, error),
                        now,
                    ));
                }
                CacheRebuildStatus::Completed => {
                    info!("缓存分区 {} 重建完成", job.partition_key)
                }
                CacheRebuildStatus::Idle => {}
            }
        }

        let cleaned = self.rebuilder.cleanup_completed().await?;
        if cleaned > 0 {
            debug!("清理了 {} 个已结束的重建作业", cleaned);
        }

        let partitions = self.rebuilder.partition_statuses().await?;
        let stale_cutoff = now - self.config.stale_after();
        let mut missing = Vec::new();

        for partition in partitions {
            if partition.is_missing() {
                missing.push(partition.partition_key);
                continue;
            }
            if let Some(refreshed_at) = partition.refreshed_at.filter(|t| *t < stale_cutoff) {
                let age_seconds = (now - refreshed_at).num_seconds();
                alerts.push(Alert::new(
                    AlertLevel::Warning,
                    AlertKind::StaleCache {
                        partition_key: partition.partition_key.clone(),
                        age_seconds,
                    },
                    format!(
                        "缓存分区 {} 已 {} 小时未刷新，需要管理员触发刷新",
                        partition.partition_key,
                        age_seconds / 3600
                    ),
                    now,
                ));
            }
        }

        if let Some(partition_key) = missing.first() {
            self.auto_rebuild(partition_key).await;
        }

        Ok(alerts)
    }

    async fn auto_rebuild(&self, partition_key: &str) {
        match self.pause_flag.is_paused().await {
            Ok(false) => {}
            Ok(true) => {
                info!("流水线已暂停，不自动重建缺失分区 {}", partition_key);
                return;
            }
            Err(e) => {
                warn!("读取暂停开关失败，不自动重建缺失分区 {}: {}", partition_key, e);
                return;
            }
        }

        let result = self.try_start(partition_key).await;
        if result.success {
            info!("自动重建缺失的缓存分区 {}", partition_key);
        } else {
            info!("缺失的缓存分区 {} 暂不重建: {}", partition_key, result.message);
        }
    }
}
