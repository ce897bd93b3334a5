use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ingest_core::{
    config::{AlertThresholds, RecoveryConfig},
    models::{Alert, AlertKind, AlertLevel},
    traits::{JobRepository, PauseFlag, RecordRepository, UploadRecovery},
    Clock, SupervisorResult,
};

use crate::alert_store::AlertStore;
use crate::phased_recovery::{PhasedRecovery, PhasedRecoveryReport};

/// 恢复报告
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub stuck_jobs_reset: u64,
    pub orphaned_leases_released: u64,
    pub unrecoverable_jobs_failed: u64,
    pub uploads_recovered: u64,
    pub phased: Option<PhasedRecoveryReport>,
}

impl RecoveryReport {
    pub fn changed_anything(&self) -> bool {
        self.stuck_jobs_reset > 0
            || self.orphaned_leases_released > 0
            || self.unrecoverable_jobs_failed > 0
            || self.uploads_recovered > 0
            || self.phased.is_some()
    }
}

/// 一次恢复请求的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// 暂停开关打开，未执行任何操作
    Paused,
    /// 已有恢复在执行
    AlreadyRunning,
    Completed(RecoveryReport),
}

/// 恢复编排器
///
/// 每个动作都是条件更新，重复执行不会产生额外变更。同一进程内同时最多
/// 只有一次恢复在执行。
pub struct RecoveryOrchestrator {
    job_repo: Arc<dyn JobRepository>,
    record_repo: Arc<dyn RecordRepository>,
    upload_recovery: Arc<dyn UploadRecovery>,
    pause_flag: Arc<dyn PauseFlag>,
    phased: PhasedRecovery,
    alert_store: Arc<AlertStore>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    thresholds: AlertThresholds,
    instance_id: String,
    in_flight: Mutex<()>,
}

impl RecoveryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        record_repo: Arc<dyn RecordRepository>,
        upload_recovery: Arc<dyn UploadRecovery>,
        pause_flag: Arc<dyn PauseFlag>,
        phased: PhasedRecovery,
        alert_store: Arc<AlertStore>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
        thresholds: AlertThresholds,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            job_repo,
            record_repo,
            upload_recovery,
            pause_flag,
            phased,
            alert_store,
            clock,
            config,
            thresholds,
            instance_id: instance_id.into(),
            in_flight: Mutex::new(()),
        }
    }

    /// 暂停开关是否打开，读取失败时按已暂停处理
    pub async fn is_paused(&self) -> bool {
        match self.pause_flag.is_paused().await {
            Ok(paused) => paused,
            Err(e) => {
                warn!("读取暂停开关失败，跳过自动恢复: {}", e);
                true
            }
        }
    }

    /// 执行一次完整恢复
    pub async fn run(&self) -> SupervisorResult<RecoveryOutcome> {
        if self.is_paused().await {
            info!("流水线已暂停，跳过自动恢复");
            return Ok(RecoveryOutcome::Paused);
        }

        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("已有恢复在执行，跳过本次请求");
            return Ok(RecoveryOutcome::AlreadyRunning);
        };

        info!("开始自动恢复");
        let mut report = RecoveryReport {
            stuck_jobs_reset: self.reset_stuck_jobs().await?,
            orphaned_leases_released: self.release_orphaned_leases().await?,
            unrecoverable_jobs_failed: self.repair_unrecoverable_jobs().await?,
            uploads_recovered: self.recover_orphaned_uploads().await?,
            phased: None,
        };

        let pending = self.record_repo.count_pending().await?;
        if pending > self.config.emergency_backlog_threshold {
            warn!(
                "待处理积压 {} 超过紧急阈值 {}，执行分阶段恢复",
                pending, self.config.emergency_backlog_threshold
            );
            let phased = self.phased.run().await?;
            self.alert_store
                .record(phased.to_alert(self.clock.now()))
                .await;
            report.phased = Some(phased);
        }

        if report.changed_anything() {
            self.alert_store.record(self.summary_alert(&report)).await;
        }

        metrics::counter!("supervisor_recovery_runs_total").increment(1);
        metrics::counter!("supervisor_stuck_jobs_reset_total").increment(report.stuck_jobs_reset);
        metrics::counter!("supervisor_orphaned_leases_released_total")
            .increment(report.orphaned_leases_released);

        info!(
            "自动恢复完成: 重置 {} 个卡住作业，释放 {} 个孤儿租约，{} 个作业转为失败，恢复 {} 个上传",
            report.stuck_jobs_reset,
            report.orphaned_leases_released,
            report.unrecoverable_jobs_failed,
            report.uploads_recovered
        );
        Ok(RecoveryOutcome::Completed(report))
    }

    /// 重置卡住的作业
    pub async fn reset_stuck_jobs(&self) -> SupervisorResult<u64> {
        let cutoff = self.clock.now() - self.thresholds.stuck_threshold();
        let reset = self.job_repo.reset_stuck_jobs(cutoff).await?;
        if reset > 0 {
            warn!("重置了 {} 个卡住的作业", reset);
        }
        Ok(reset)
    }

    /// 释放其他实例遗留的租约，从不触碰当前实例持有的租约
    pub async fn release_orphaned_leases(&self) -> SupervisorResult<u64> {
        let cutoff = self.clock.now() - self.config.orphaned_lease_threshold();
        let released = self
            .job_repo
            .release_orphaned_leases(&self.instance_id, cutoff)
            .await?;
        if released > 0 {
            warn!("释放了 {} 个孤儿租约", released);
        }
        Ok(released)
    }

    /// 不可恢复的输入转为终态 failed，等待重新上传
    pub async fn repair_unrecoverable_jobs(&self) -> SupervisorResult<u64> {
        if self.config.unrecoverable_markers.is_empty() {
            return Ok(0);
        }
        let failed = self
            .job_repo
            .fail_unrecoverable_jobs(&self.config.unrecoverable_markers)
            .await?;
        if failed > 0 {
            warn!("{} 个作业因不可恢复的输入标记为失败，需要重新上传", failed);
        }
        Ok(failed)
    }

    pub async fn recover_orphaned_uploads(&self) -> SupervisorResult<u64> {
        let stale_before = self.clock.now() - self.config.orphaned_upload_threshold();
        let orphans = self
            .upload_recovery
            .find_orphaned_uploads(stale_before)
            .await?;
        if orphans.is_empty() {
            return Ok(0);
        }

        for upload in &orphans {
            debug!("孤儿上传: {} ({}, {})", upload.id, upload.filename, upload.status);
        }
        let ids: Vec<String> = orphans.into_iter().map(|u| u.id).collect();
        let recovered = self.upload_recovery.recover(&ids).await?;
        info!("恢复了 {} / {} 个孤儿上传", recovered, ids.len());
        Ok(recovered)
    }

    fn summary_alert(&self, report: &RecoveryReport) -> Alert {
        Alert::new(
            AlertLevel::Info,
            AlertKind::RecoveryPerformed {
                stuck_jobs_reset: report.stuck_jobs_reset,
                orphaned_leases_released: report.orphaned_leases_released,
                unrecoverable_jobs_failed: report.unrecoverable_jobs_failed,
                uploads_recovered: report.uploads_recovered,
            },
            format!(
                "自动恢复: 重置 {} 个作业，释放 {} 个租约，{} 个作业需要重新上传，恢复 {} 个上传",
                report.stuck_jobs_reset,
                report.orphaned_leases_released,
                report.unrecoverable_jobs_failed,
                report.uploads_recovered
            ),
            self.clock.now(),
        )
    }
}
