//! 分阶段积压恢复
//!
//! 记录类型按配置划分为互不相交的层级：
//!
//! - 第一、二层：快速路径，按 pending 数量从大到小直接批量标记为 processed
//! - 第三层：逐条在独立事务中交给记录处理器，失败回滚并标记 skipped
//! - 第四层：其余所有类型一次性交给批量处理器
//!
//! 所有状态更新都只作用于仍为 pending 的记录，同一条记录不会被两个层级处理。

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, info, warn};

use ingest_core::{
    config::RecoveryConfig,
    models::{
        truncate_reason, Alert, AlertKind, AlertLevel, PhaseAction, PipelineRecord,
        RecoveryPhase, MAX_SKIP_REASON_LEN,
    },
    traits::{BulkProcessor, RecordProcessor, RecordRepository},
    Clock, SupervisorResult,
};

/// 一次分阶段恢复的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhasedRecoveryReport {
    pub phases: Vec<RecoveryPhase>,
    pub total_processed: u64,
    pub total_skipped: u64,
    pub bulk_warnings: u64,
    pub bulk_errors: u64,
    pub duration_ms: u64,
    pub records_per_minute: f64,
}

impl PhasedRecoveryReport {
    fn push(&mut self, phase: RecoveryPhase) {
        match phase.action {
            PhaseAction::Processed => self.total_processed += phase.records_affected,
            PhaseAction::Skipped => self.total_skipped += phase.records_affected,
            PhaseAction::Reset => {}
        }
        self.phases.push(phase);
    }

    fn next_index(&self) -> u32 {
        self.phases.len() as u32 + 1
    }

    fn finish(&mut self, started: Instant) {
        self.duration_ms = started.elapsed().as_millis() as u64;
        let minutes = self.duration_ms.max(1) as f64 / 60_000.0;
        self.records_per_minute = (self.total_processed + self.total_skipped) as f64 / minutes;
    }

    pub fn to_alert(&self, now: DateTime<Utc>) -> Alert {
        Alert::new(
            AlertLevel::Info,
            AlertKind::PhasedRecoveryCompleted {
                phases: self.phases.clone(),
                total_processed: self.total_processed,
                total_skipped: self.total_skipped,
                bulk_warnings: self.bulk_warnings,
                bulk_errors: self.bulk_errors,
                duration_ms: self.duration_ms,
                records_per_minute: self.records_per_minute,
            },
            format!(
                "分阶段恢复完成: {} 个阶段，处理 {} 条，跳过 {} 条，耗时 {} ms",
                self.phases.len(),
                self.total_processed,
                self.total_skipped,
                self.duration_ms
            ),
            now,
        )
    }
}

enum RecordOutcome {
    Processed,
    Skipped,
    AlreadyHandled,
}

pub struct PhasedRecovery {
    record_repo: Arc<dyn RecordRepository>,
    processor: Arc<dyn RecordProcessor>,
    bulk_processor: Arc<dyn BulkProcessor>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl PhasedRecovery {
    pub fn new(
        record_repo: Arc<dyn RecordRepository>,
        processor: Arc<dyn RecordProcessor>,
        bulk_processor: Arc<dyn BulkProcessor>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            record_repo,
            processor,
            bulk_processor,
            clock,
            config,
        }
    }

    pub async fn run(&self) -> SupervisorResult<PhasedRecoveryReport> {
        let started = Instant::now();
        let mut report = PhasedRecoveryReport::default();

        info!("开始分阶段恢复");

        self.fast_path_pass(&mut report).await?;

        if self.config.second_pass_enabled {
            let remaining = self.record_repo.count_pending().await?;
            if remaining > self.config.emergency_backlog_threshold {
                info!("积压仍有 {} 条，执行第二轮快速路径", remaining);
                self.fast_path_pass(&mut report).await?;
            }
        }

        self.per_record_pass(&mut report).await?;
        self.bulk_pass(&mut report).await?;

        report.finish(started);
        info!(
            "分阶段恢复结束: 处理 {} 条，跳过 {} 条，{:.0} 条/分钟",
            report.total_processed, report.total_skipped, report.records_per_minute
        );
        Ok(report)
    }

    /// 第一、二层
    async fn fast_path_pass(&self, report: &mut PhasedRecoveryReport) -> SupervisorResult<()> {
        let mut targets: Vec<(String, u64)> = self
            .record_repo
            .counts_by_type()
            .await?
            .into_iter()
            .filter(|c| c.pending > 0 && self.config.fast_path_types.contains(&c.record_type))
            .map(|c| (c.record_type, c.pending))
            .collect();
        targets.sort_by(|a, b| b.1.cmp(&a.1));

        for (record_type, pending) in targets {
            let mut affected = 0u64;
            for _ in 0..self.config.max_batches_per_pass {
                let now = self.clock.now();
                let updated = self
                    .record_repo
                    .mark_pending_processed(&record_type, self.config.batch_size, now)
                    .await?;
                affected += updated;
                if updated < self.config.batch_size as u64 {
                    break;
                }
            }

            debug!(
                "快速路径 {}: 处理 {} / {} 条",
                record_type, affected, pending
            );
            if affected > 0 {
                let index = report.next_index();
                report.push(RecoveryPhase::new(
                    index,
                    record_type,
                    affected,
                    PhaseAction::Processed,
                ));
            }
        }
        Ok(())
    }

    /// 第三层
    async fn per_record_pass(&self, report: &mut PhasedRecoveryReport) -> SupervisorResult<()> {
        if self.config.per_record_types.is_empty() {
            return Ok(());
        }

        let records = self
            .record_repo
            .list_pending(&self.config.per_record_types, self.config.per_record_limit)
            .await?;
        if records.is_empty() {
            return Ok(());
        }

        let mut processed = 0u64;
        let mut skipped = 0u64;
        for record in &records {
            match self.process_record(record).await? {
                RecordOutcome::Processed => processed += 1,
                RecordOutcome::Skipped => skipped += 1,
                RecordOutcome::AlreadyHandled => {}
            }
        }

        let class = self.config.per_record_types.join(",");
        if processed > 0 {
            let index = report.next_index();
            report.push(RecoveryPhase::new(
                index,
                class.clone(),
                processed,
                PhaseAction::Processed,
            ));
        }
        if skipped > 0 {
            let index = report.next_index();
            report.push(RecoveryPhase::new(index, class, skipped, PhaseAction::Skipped));
        }
        Ok(())
    }

    /// 单条记录在独立事务中处理，失败回滚后标记 skipped
    async fn process_record(&self, record: &PipelineRecord) -> SupervisorResult<RecordOutcome> {
        let now = self.clock.now();
        let mut tx = self.record_repo.begin().await?;

        if !tx.mark_processed(record.id, now).await? {
            tx.rollback().await?;
            return Ok(RecordOutcome::AlreadyHandled);
        }

        let failure = match AssertUnwindSafe(self.processor.process(record))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                tx.commit().await?;
                return Ok(RecordOutcome::Processed);
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        tx.rollback().await?;
        let reason = truncate_reason(&failure, MAX_SKIP_REASON_LEN);
        warn!("记录 {} 处理失败，标记为跳过: {}", record.id, reason);
        self.record_repo
            .mark_skipped(record.id, &reason, self.clock.now())
            .await?;
        Ok(RecordOutcome::Skipped)
    }

    /// 第四层
    async fn bulk_pass(&self, report: &mut PhasedRecoveryReport) -> SupervisorResult<()> {
        let handled: HashSet<&String> = self
            .config
            .fast_path_types
            .iter()
            .chain(self.config.per_record_types.iter())
            .collect();

        let remaining: Vec<String> = self
            .record_repo
            .counts_by_type()
            .await?
            .into_iter()
            .filter(|c| c.pending > 0 && !handled.contains(&c.record_type))
            .map(|c| c.record_type)
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        info!("批量处理剩余记录类型: {:?}", remaining);
        let outcome = self
            .bulk_processor
            .process_pending(&remaining, self.config.batch_size)
            .await?;

        report.bulk_warnings += outcome.warnings;
        report.bulk_errors += outcome.errors;
        let index = report.next_index();
        report.push(RecoveryPhase::new(
            index,
            remaining.join(","),
            outcome.processed,
            PhaseAction::Processed,
        ));
        Ok(())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::models::RecordStatus;
    use ingest_testing_utils::{
        ManualClock, MockBulkProcessor, MockRecordProcessor, MockRecordRepository, RecordBuilder,
    };

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            emergency_backlog_threshold: 10,
            batch_size: 4,
            max_batches_per_pass: 2,
            second_pass_enabled: true,
            fast_path_types: vec!["DT".to_string(), "BH".to_string()],
            per_record_types: vec!["P1".to_string()],
            per_record_limit: 100,
            ..Default::default()
        }
    }

    fn phased(
        records: &MockRecordRepository,
        processor: &MockRecordProcessor,
        bulk: &MockBulkProcessor,
        config: RecoveryConfig,
    ) -> PhasedRecovery {
        PhasedRecovery::new(
            Arc::new(records.clone()),
            Arc::new(processor.clone()),
            Arc::new(bulk.clone()),
            Arc::new(ManualClock::fixed()),
            config,
        )
    }

    #[tokio::test]
    async fn test_fast_path_largest_type_first_and_bounded() {
        let mut seed = RecordBuilder::pending_batch("DT", 1, 5);
        seed.extend(RecordBuilder::pending_batch("BH", 100, 20));
        let records = MockRecordRepository::with_records(seed);
        let processor = MockRecordProcessor::new();
        let bulk = MockBulkProcessor::new(records.clone());
        let mut config = config();
        config.second_pass_enabled = false;

        let report = phased(&records, &processor, &bulk, config).run().await.unwrap();

        // BH 先处理，每轮最多 2 批 x 4 条
        assert_eq!(report.phases[0].record_type_class, "BH");
        assert_eq!(report.phases[0].records_affected, 8);
        assert_eq!(report.phases[1].record_type_class, "DT");
        assert_eq!(report.phases[1].records_affected, 5);
        assert_eq!(report.total_processed, 13);
        assert_eq!(records.pending_count(), 12);
    }

    #[tokio::test]
    async fn test_second_pass_while_backlog_large() {
        let records = MockRecordRepository::with_records(RecordBuilder::pending_batch("BH", 1, 30));
        let processor = MockRecordProcessor::new();
        let bulk = MockBulkProcessor::new(records.clone());

        let report = phased(&records, &processor, &bulk, config()).run().await.unwrap();

        // 第一轮 8 条后剩 22 > 10，执行第二轮
        assert_eq!(report.phases.len(), 2);
        assert_eq!(report.total_processed, 16);
        assert_eq!(records.pending_count(), 14);
    }

    #[tokio::test]
    async fn test_per_record_failure_is_skipped_and_batch_continues() {
        let records = MockRecordRepository::with_records(RecordBuilder::pending_batch("P1", 1, 3));
        let processor = MockRecordProcessor::new();
        processor.fail_on(1, format!("parse error: {}", "x".repeat(800)));
        let bulk = MockBulkProcessor::new(records.clone());

        let report = phased(&records, &processor, &bulk, config()).run().await.unwrap();

        let failed = records.get(1).unwrap();
        assert_eq!(failed.status, RecordStatus::Skipped);
        let reason = failed.skip_reason.unwrap();
        assert!(reason.chars().count() <= MAX_SKIP_REASON_LEN);
        assert!(reason.contains("parse error"));

        assert_eq!(records.get(2).unwrap().status, RecordStatus::Processed);
        assert_eq!(records.get(3).unwrap().status, RecordStatus::Processed);
        assert_eq!(processor.processed_ids(), vec![2, 3]);
        assert_eq!(report.total_processed, 2);
        assert_eq!(report.total_skipped, 1);
    }

    #[tokio::test]
    async fn test_per_record_panic_is_contained() {
        let records = MockRecordRepository::with_records(RecordBuilder::pending_batch("P1", 1, 2));
        let processor = MockRecordProcessor::new();
        processor.panic_on(1);
        let bulk = MockBulkProcessor::new(records.clone());

        let report = phased(&records, &processor, &bulk, config()).run().await.unwrap();

        assert_eq!(records.get(1).unwrap().status, RecordStatus::Skipped);
        assert_eq!(records.get(2).unwrap().status, RecordStatus::Processed);
        assert_eq!(report.total_skipped, 1);
    }

    #[tokio::test]
    async fn test_bulk_tier_gets_only_remaining_types() {
        let mut seed = RecordBuilder::pending_batch("DT", 1, 2);
        seed.extend(RecordBuilder::pending_batch("P1", 10, 2));
        seed.extend(RecordBuilder::pending_batch("AD", 20, 3));
        seed.extend(RecordBuilder::pending_batch("CT", 30, 1));
        let records = MockRecordRepository::with_records(seed);
        let processor = MockRecordProcessor::new();
        let bulk = MockBulkProcessor::new(records.clone());
        bulk.set_warnings(2);

        let report = phased(&records, &processor, &bulk, config()).run().await.unwrap();

        assert_eq!(bulk.calls(), vec![vec!["AD".to_string(), "CT".to_string()]]);
        assert_eq!(report.bulk_warnings, 2);
        assert_eq!(report.total_processed, 8);
        assert_eq!(records.pending_count(), 0);

        let alert = report.to_alert(Utc::now());
        assert_eq!(alert.category(), "phased_recovery_completed");
    }
}
