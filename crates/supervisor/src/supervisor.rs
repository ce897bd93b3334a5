//! 处理监督器
//!
//! 持有四个独立的周期任务，每种任务一个 tokio 任务：
//!
//! | 任务 | 默认间隔 | 内容 |
//! |---|---|---|
//! | backlog | 30s | 积压采样、停滞检测、孤儿租约清理、指标快照 |
//! | health_check | 120s | 完整健康检查，必要时执行恢复 |
//! | cache_status | 300s | 缓存分区检查 |
//! | resource | 60s | 内存与数据存储延迟 |
//!
//! 同一种任务同一时间最多执行一次：定时触发使用 `try_lock`，忙时跳过；
//! 手动健康检查使用 `lock`，排队等待。任务体中的错误和 panic 都在任务
//! 边界被转换为 error 级别的 `task_failure` 告警，不会中断调度。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ingest_core::{
    config::SupervisorConfig,
    models::{
        Alert, AlertKind, AlertLevel, CacheRefreshResult, PipelineSnapshot, QueueStatus,
        SupervisorTask,
    },
    traits::{
        AlertLogSink, BulkProcessor, CacheRebuilder, DatastoreProbe, JobRepository, MemoryProbe,
        PauseFlag, RebuildCooldownStore, RecordProcessor, RecordRepository, UploadRecovery,
    },
    Clock, SupervisorResult,
};

use crate::alert_analyzer::{requires_recovery, AlertAnalyzer};
use crate::alert_store::AlertStore;
use crate::backlog_tracker::{BacklogObservation, BacklogTracker};
use crate::cache_coordinator::CacheCoordinator;
use crate::metrics_collector::MetricsCollector;
use crate::phased_recovery::{panic_message, PhasedRecovery};
use crate::recovery_service::RecoveryOrchestrator;
use crate::resource_monitor::ResourceMonitor;

/// 监督器依赖的外部协作者
#[derive(Clone)]
pub struct SupervisorDeps {
    pub job_repo: Arc<dyn JobRepository>,
    pub record_repo: Arc<dyn RecordRepository>,
    pub alert_log: Arc<dyn AlertLogSink>,
    pub pause_flag: Arc<dyn PauseFlag>,
    pub record_processor: Arc<dyn RecordProcessor>,
    pub bulk_processor: Arc<dyn BulkProcessor>,
    pub upload_recovery: Arc<dyn UploadRecovery>,
    pub cache_rebuilder: Arc<dyn CacheRebuilder>,
    pub cooldown_store: Arc<dyn RebuildCooldownStore>,
    pub datastore_probe: Arc<dyn DatastoreProbe>,
    pub memory_probe: Arc<dyn MemoryProbe>,
    pub clock: Arc<dyn Clock>,
}

/// 监督器运行状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub alert_count: usize,
    pub last_check_time: Option<DateTime<Utc>>,
}

struct TaskLocks {
    backlog: Mutex<()>,
    health_check: Mutex<()>,
    cache_status: Mutex<()>,
    resource: Mutex<()>,
}

impl TaskLocks {
    fn new() -> Self {
        Self {
            backlog: Mutex::new(()),
            health_check: Mutex::new(()),
            cache_status: Mutex::new(()),
            resource: Mutex::new(()),
        }
    }

    fn get(&self, task: SupervisorTask) -> &Mutex<()> {
        match task {
            SupervisorTask::Backlog => &self.backlog,
            SupervisorTask::HealthCheck => &self.health_check,
            SupervisorTask::CacheStatus => &self.cache_status,
            SupervisorTask::Resource => &self.resource,
        }
    }
}

struct SupervisorInner {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    collector: MetricsCollector,
    tracker: Mutex<BacklogTracker>,
    analyzer: AlertAnalyzer,
    recovery: RecoveryOrchestrator,
    resource_monitor: ResourceMonitor,
    cache: CacheCoordinator,
    alerts: Arc<AlertStore>,
    last_snapshot: RwLock<Option<PipelineSnapshot>>,
    last_check_time: RwLock<Option<DateTime<Utc>>>,
    running: AtomicBool,
    locks: TaskLocks,
}

/// 处理监督器
pub struct ProcessingSupervisor {
    inner: Arc<SupervisorInner>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessingSupervisor {
    pub fn new(config: SupervisorConfig, deps: SupervisorDeps) -> Self {
        let alerts = Arc::new(AlertStore::new(
            deps.alert_log.clone(),
            config.alerts.history_limit,
        ));

        let collector = MetricsCollector::new(
            deps.job_repo.clone(),
            deps.record_repo.clone(),
            deps.clock.clone(),
            config.alerts.clone(),
        );

        let phased = PhasedRecovery::new(
            deps.record_repo.clone(),
            deps.record_processor.clone(),
            deps.bulk_processor.clone(),
            deps.clock.clone(),
            config.recovery.clone(),
        );

        let recovery = RecoveryOrchestrator::new(
            deps.job_repo.clone(),
            deps.record_repo.clone(),
            deps.upload_recovery.clone(),
            deps.pause_flag.clone(),
            phased,
            alerts.clone(),
            deps.clock.clone(),
            config.recovery.clone(),
            config.alerts.clone(),
            config.instance_id.clone(),
        );

        let resource_monitor = ResourceMonitor::new(
            deps.memory_probe.clone(),
            deps.datastore_probe.clone(),
            deps.clock.clone(),
            config.resource.clone(),
        );

        let cache = CacheCoordinator::new(
            deps.cache_rebuilder.clone(),
            deps.pause_flag.clone(),
            deps.cooldown_store.clone(),
            deps.clock.clone(),
            config.cache.clone(),
        );

        let inner = SupervisorInner {
            tracker: Mutex::new(BacklogTracker::new(&config.backlog)),
            analyzer: AlertAnalyzer::new(config.alerts.clone()),
            clock: deps.clock.clone(),
            collector,
            recovery,
            resource_monitor,
            cache,
            alerts,
            last_snapshot: RwLock::new(None),
            last_check_time: RwLock::new(None),
            running: AtomicBool::new(false),
            locks: TaskLocks::new(),
            config,
        };

        Self {
            inner: Arc::new(inner),
            shutdown_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 启动全部周期任务，已在运行时不做任何事
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("处理监督器已在运行");
            return;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let intervals = &self.inner.config.intervals;
        let schedule = [
            (SupervisorTask::Backlog, intervals.backlog_seconds),
            (SupervisorTask::HealthCheck, intervals.health_check_seconds),
            (SupervisorTask::CacheStatus, intervals.cache_check_seconds),
            (SupervisorTask::Resource, intervals.resource_check_seconds),
        ];

        let mut handles = self.handles.lock().await;
        for (task, seconds) in schedule {
            handles.push(spawn_task_loop(
                self.inner.clone(),
                task,
                Duration::from_secs(seconds),
                shutdown_tx.subscribe(),
            ));
        }
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        info!(
            "处理监督器已启动 (实例 {})",
            self.inner.config.instance_id
        );
    }

    /// 停止调度，正在执行的任务体会执行完毕
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("等待监督任务退出时出错: {}", e);
            }
        }

        info!("处理监督器已停止");
    }

    pub async fn get_status(&self) -> SupervisorStatus {
        SupervisorStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            alert_count: self.inner.alerts.len().await,
            last_check_time: *self.inner.last_check_time.read().await,
        }
    }

    /// 最近的告警，新的在前
    pub async fn get_recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.inner.alerts.recent(limit).await
    }

    /// 最近一次健康检查的快照，还没有检查过时现场采集
    pub async fn get_current_metrics(&self) -> PipelineSnapshot {
        if let Some(snapshot) = self.inner.last_snapshot.read().await.clone() {
            return snapshot;
        }
        self.inner.collector.collect().await
    }

    /// 立即执行一次健康检查；如果定时检查正在执行则等待其结束
    pub async fn force_health_check(&self) -> Vec<Alert> {
        let _guard = self.inner.locks.get(SupervisorTask::HealthCheck).lock().await;
        self.inner.run_task(SupervisorTask::HealthCheck).await
    }

    /// 立即执行一次积压采样
    pub async fn run_backlog_check(&self) -> Vec<Alert> {
        let _guard = self.inner.locks.get(SupervisorTask::Backlog).lock().await;
        self.inner.run_task(SupervisorTask::Backlog).await
    }

    pub async fn run_cache_check(&self) -> Vec<Alert> {
        let _guard = self.inner.locks.get(SupervisorTask::CacheStatus).lock().await;
        self.inner.run_task(SupervisorTask::CacheStatus).await
    }

    pub async fn run_resource_check(&self) -> Vec<Alert> {
        let _guard = self.inner.locks.get(SupervisorTask::Resource).lock().await;
        self.inner.run_task(SupervisorTask::Resource).await
    }

    /// 管理员触发缓存分区重建，与自动重建共用冷却时间
    pub async fn start_cache_refresh(
        &self,
        partition_key: &str,
        requested_by: &str,
    ) -> CacheRefreshResult {
        self.inner.cache.request_rebuild(partition_key, requested_by).await
    }

    /// 上传队列状态
    pub async fn queue_status(&self) -> QueueStatus {
        let snapshot = self.get_current_metrics().await;
        QueueStatus::from_snapshot(&snapshot, self.inner.config.max_concurrent_uploads)
    }
}

fn spawn_task_loop(
    inner: Arc<SupervisorInner>,
    task: SupervisorTask,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("周期任务 {} 已启动，间隔 {:?}", task, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    inner.scheduled_tick(task).await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("周期任务 {} 收到停止信号", task);
                    break;
                }
            }
        }
    })
}

impl SupervisorInner {
    async fn scheduled_tick(&self, task: SupervisorTask) {
        let Ok(_guard) = self.locks.get(task).try_lock() else {
            debug!("周期任务 {} 仍在执行，跳过本次触发", task);
            return;
        };
        self.run_task(task).await;
    }

    /// 任务边界：错误和 panic 都转换为告警
    async fn run_task(&self, task: SupervisorTask) -> Vec<Alert> {
        let outcome = AssertUnwindSafe(self.task_body(task)).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(alerts)) => return alerts,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
        };

        let alert = Alert::new(
            AlertLevel::Error,
            AlertKind::TaskFailure {
                task,
                error: error.clone(),
            },
            format!("周期任务 {} 执行失败: {}", task, error),
            self.clock.now(),
        );
        self.alerts.record(alert.clone()).await;
        vec![alert]
    }

    async fn task_body(&self, task: SupervisorTask) -> SupervisorResult<Vec<Alert>> {
        match task {
            SupervisorTask::Backlog => self.backlog_tick().await,
            SupervisorTask::HealthCheck => self.health_check_tick().await,
            SupervisorTask::CacheStatus => self.cache_tick().await,
            SupervisorTask::Resource => self.resource_tick().await,
        }
    }

    async fn backlog_tick(&self) -> SupervisorResult<Vec<Alert>> {
        let snapshot = self.collector.collect().await;
        let observation = self
            .tracker
            .lock()
            .await
            .record(snapshot.pending_backlog, snapshot.captured_at);

        let mut alerts = Vec::new();
        let mut stalled = false;
        match observation {
            BacklogObservation::Stalled(alert) => {
                self.alerts.record(alert.clone()).await;
                alerts.push(alert);
                stalled = true;
            }
            BacklogObservation::Drained => info!("积压已清空"),
            BacklogObservation::Idle
            | BacklogObservation::Progressing
            | BacklogObservation::StillStalled => {}
        }

        self.alerts.record_metrics(&snapshot).await;

        if stalled {
            self.recovery.run().await?;
        } else if !self.recovery.is_paused().await {
            self.recovery.release_orphaned_leases().await?;
        }

        Ok(alerts)
    }

    async fn health_check_tick(&self) -> SupervisorResult<Vec<Alert>> {
        let snapshot = self.collector.collect().await;
        let previous = self.last_snapshot.read().await.clone();
        let alerts = self.analyzer.analyze(&snapshot, previous.as_ref());

        self.alerts.record_all(alerts.clone()).await;
        *self.last_snapshot.write().await = Some(snapshot);
        *self.last_check_time.write().await = Some(self.clock.now());

        if requires_recovery(&alerts) {
            self.recovery.run().await?;
        }

        Ok(alerts)
    }

    async fn cache_tick(&self) -> SupervisorResult<Vec<Alert>> {
        let alerts = self.cache.check().await?;
        self.alerts.record_all(alerts.clone()).await;
        Ok(alerts)
    }

    async fn resource_tick(&self) -> SupervisorResult<Vec<Alert>> {
        let alerts = self.resource_monitor.check().await;
        self.alerts.record_all(alerts.clone()).await;
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_testing_utils::{
        ManualClock, MockAlertLog, MockBulkProcessor, MockCacheRebuilder, MockDatastoreProbe,
        MockJobRepository, MockMemoryProbe, MockPauseFlag, MockRebuildCooldownStore,
        MockRecordProcessor, MockRecordRepository, MockUploadRecovery,
    };

    fn supervisor_with_probe(probe: &MockDatastoreProbe) -> ProcessingSupervisor {
        let records = MockRecordRepository::new();
        let deps = SupervisorDeps {
            job_repo: Arc::new(MockJobRepository::new()),
            record_repo: Arc::new(records.clone()),
            alert_log: Arc::new(MockAlertLog::new()),
            pause_flag: Arc::new(MockPauseFlag::new(false)),
            record_processor: Arc::new(MockRecordProcessor::new()),
            bulk_processor: Arc::new(MockBulkProcessor::new(records)),
            upload_recovery: Arc::new(MockUploadRecovery::new()),
            cache_rebuilder: Arc::new(MockCacheRebuilder::new()),
            cooldown_store: Arc::new(MockRebuildCooldownStore::new()),
            datastore_probe: Arc::new(probe.clone()),
            memory_probe: Arc::new(MockMemoryProbe::default()),
            clock: Arc::new(ManualClock::fixed()),
        };
        ProcessingSupervisor::new(SupervisorConfig::default(), deps)
    }

    #[tokio::test]
    async fn test_overlapping_scheduled_tick_is_skipped() {
        let probe = MockDatastoreProbe::with_delay(Duration::from_millis(200));
        let supervisor = supervisor_with_probe(&probe);
        let inner = &supervisor.inner;

        tokio::join!(
            inner.scheduled_tick(SupervisorTask::Resource),
            inner.scheduled_tick(SupervisorTask::Resource),
        );
        assert_eq!(probe.ping_count(), 1);

        // 上一次执行结束后锁已释放
        inner.scheduled_tick(SupervisorTask::Resource).await;
        assert_eq!(probe.ping_count(), 2);
    }

    #[tokio::test]
    async fn test_scheduled_tick_skips_while_manual_run_holds_lock() {
        let probe = MockDatastoreProbe::with_delay(Duration::from_millis(200));
        let supervisor = supervisor_with_probe(&probe);

        tokio::join!(
            supervisor.run_resource_check(),
            supervisor.inner.scheduled_tick(SupervisorTask::Resource),
        );
        assert_eq!(probe.ping_count(), 1);
    }
}
