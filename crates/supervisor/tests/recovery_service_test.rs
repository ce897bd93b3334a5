use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;

use ingest_core::clock::Clock;
use ingest_core::config::{AlertThresholds, RecoveryConfig};
use ingest_core::models::{JobStatus, OrphanedUpload, RecordStatus};
use ingest_supervisor::{
    AlertStore, PhasedRecovery, RecoveryOrchestrator, RecoveryOutcome, RecoveryReport,
};
use ingest_testing_utils::{
    JobBuilder, ManualClock, MockAlertLog, MockBulkProcessor, MockJobRepository, MockPauseFlag,
    MockRecordProcessor, MockRecordRepository, MockUploadRecovery, RecordBuilder,
};

const INSTANCE: &str = "watchdog-a";

struct Fixture {
    jobs: MockJobRepository,
    records: MockRecordRepository,
    uploads: MockUploadRecovery,
    pause: MockPauseFlag,
    processor: MockRecordProcessor,
    bulk: MockBulkProcessor,
    log: MockAlertLog,
    clock: ManualClock,
}

impl Fixture {
    fn new(jobs: MockJobRepository, records: MockRecordRepository) -> Self {
        Self {
            bulk: MockBulkProcessor::new(records.clone()),
            jobs,
            records,
            uploads: MockUploadRecovery::new(),
            pause: MockPauseFlag::new(false),
            processor: MockRecordProcessor::new(),
            log: MockAlertLog::new(),
            clock: ManualClock::fixed(),
        }
    }

    fn orchestrator(&self, config: RecoveryConfig) -> RecoveryOrchestrator {
        let phased = PhasedRecovery::new(
            Arc::new(self.records.clone()),
            Arc::new(self.processor.clone()),
            Arc::new(self.bulk.clone()),
            Arc::new(self.clock.clone()),
            config.clone(),
        );
        RecoveryOrchestrator::new(
            Arc::new(self.jobs.clone()),
            Arc::new(self.records.clone()),
            Arc::new(self.uploads.clone()),
            Arc::new(self.pause.clone()),
            phased,
            Arc::new(AlertStore::new(Arc::new(self.log.clone()), 100)),
            Arc::new(self.clock.clone()),
            config,
            AlertThresholds::default(),
            INSTANCE,
        )
    }
}

fn completed(outcome: RecoveryOutcome) -> RecoveryReport {
    match outcome {
        RecoveryOutcome::Completed(report) => report,
        other => panic!("expected completed recovery, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stuck_job_reset_is_idempotent() {
    let clock = ManualClock::fixed();
    let now = clock.now();
    let jobs = MockJobRepository::with_jobs(vec![
        JobBuilder::new()
            .with_id(1)
            .processing(INSTANCE, now - Duration::minutes(30))
            .build(),
        JobBuilder::new()
            .with_id(2)
            .processing(INSTANCE, now - Duration::minutes(1))
            .build(),
    ]);
    let fixture = Fixture::new(jobs, MockRecordRepository::new());
    let orchestrator = fixture.orchestrator(RecoveryConfig::default());

    assert_eq!(orchestrator.reset_stuck_jobs().await.unwrap(), 1);
    assert_eq!(orchestrator.reset_stuck_jobs().await.unwrap(), 0);

    let reset = fixture.jobs.get(1).unwrap();
    assert_eq!(reset.status, JobStatus::Queued);
    assert!(reset.lease.is_none());
    assert_eq!(fixture.jobs.get(2).unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn test_orphaned_lease_release_never_touches_own_lease() {
    let clock = ManualClock::fixed();
    let now = clock.now();
    let old = now - Duration::minutes(8);
    let jobs = MockJobRepository::with_jobs(vec![
        JobBuilder::new().with_id(1).processing("watchdog-b", old).build(),
        JobBuilder::new().with_id(2).processing(INSTANCE, old).build(),
        JobBuilder::new()
            .with_id(3)
            .processing("watchdog-b", now - Duration::minutes(1))
            .build(),
    ]);
    let fixture = Fixture::new(jobs, MockRecordRepository::new());
    let orchestrator = fixture.orchestrator(RecoveryConfig::default());

    assert_eq!(orchestrator.release_orphaned_leases().await.unwrap(), 1);
    assert_eq!(orchestrator.release_orphaned_leases().await.unwrap(), 0);

    assert!(fixture.jobs.get(1).unwrap().lease.is_none());
    assert_eq!(
        fixture.jobs.get(2).unwrap().lease.map(|l| l.owner_id),
        Some(INSTANCE.to_string())
    );
    assert!(fixture.jobs.get(3).unwrap().lease.is_some());
}

#[tokio::test]
async fn test_unrecoverable_jobs_become_terminal() {
    let jobs = MockJobRepository::with_jobs(vec![
        JobBuilder::new()
            .with_id(1)
            .with_error_text("Invalid file format: missing header")
            .build(),
        JobBuilder::new()
            .with_id(2)
            .with_error_text("connection reset by peer")
            .build(),
    ]);
    let fixture = Fixture::new(jobs, MockRecordRepository::new());
    let orchestrator = fixture.orchestrator(RecoveryConfig::default());

    assert_eq!(orchestrator.repair_unrecoverable_jobs().await.unwrap(), 1);

    let failed = fixture.jobs.get(1).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.requires_resubmission);
    assert_eq!(fixture.jobs.get(2).unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn test_paused_pipeline_suppresses_recovery() {
    let clock = ManualClock::fixed();
    let jobs = MockJobRepository::with_jobs(vec![JobBuilder::new()
        .with_id(1)
        .processing(INSTANCE, clock.now() - Duration::hours(1))
        .build()]);
    let fixture = Fixture::new(jobs, MockRecordRepository::new());
    fixture.pause.set_paused(true);
    let orchestrator = fixture.orchestrator(RecoveryConfig::default());

    let outcome = orchestrator.run().await.unwrap();

    assert_eq!(outcome, RecoveryOutcome::Paused);
    assert_eq!(fixture.jobs.get(1).unwrap().status, JobStatus::Processing);
    assert!(fixture.log.alerts().is_empty());
}

#[tokio::test]
async fn test_run_summarises_changes_and_recovers_uploads() {
    let clock = ManualClock::fixed();
    let jobs = MockJobRepository::with_jobs(vec![JobBuilder::new()
        .with_id(1)
        .processing("watchdog-b", clock.now() - Duration::hours(1))
        .build()]);
    let mut fixture = Fixture::new(jobs, MockRecordRepository::new());
    fixture.uploads = MockUploadRecovery::with_orphans(vec![OrphanedUpload {
        id: "upload-1".to_string(),
        filename: "batch-0001.tsyso".to_string(),
        status: "processing".to_string(),
    }]);
    let orchestrator = fixture.orchestrator(RecoveryConfig::default());

    let report = completed(orchestrator.run().await.unwrap());

    assert_eq!(report.stuck_jobs_reset, 1);
    assert_eq!(report.uploads_recovered, 1);
    assert!(report.phased.is_none());
    assert_eq!(fixture.uploads.recovered_ids(), vec!["upload-1".to_string()]);

    let summary = fixture.log.alerts_with_category("recovery_performed");
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].details["stuck_jobs_reset"], 1);

    // 第二次运行没有可变更的行，不再产生汇总告警
    let report = completed(orchestrator.run().await.unwrap());
    assert!(!report.changed_anything());
    assert_eq!(fixture.log.alerts_with_category("recovery_performed").len(), 1);
}

#[tokio::test]
async fn test_phased_recovery_only_above_emergency_threshold() {
    let records = MockRecordRepository::with_records(RecordBuilder::pending_batch("DT", 1, 5));
    let fixture = Fixture::new(MockJobRepository::new(), records);
    let config = RecoveryConfig {
        emergency_backlog_threshold: 10,
        ..Default::default()
    };
    let orchestrator = fixture.orchestrator(config);

    let report = completed(orchestrator.run().await.unwrap());

    assert!(report.phased.is_none());
    assert_eq!(fixture.records.pending_count(), 5);
}

#[tokio::test]
async fn test_phased_recovery_partitions_records_disjointly() {
    let mut seed = RecordBuilder::pending_batch("DT", 1, 12);
    seed.extend(RecordBuilder::pending_batch("BH", 100, 7));
    seed.extend(RecordBuilder::pending_batch("P1", 200, 6));
    seed.extend(RecordBuilder::pending_batch("P2", 300, 3));
    seed.extend(RecordBuilder::pending_batch("AD", 400, 9));
    seed.extend(RecordBuilder::pending_batch("CT", 500, 4));
    let records = MockRecordRepository::with_records(seed);
    let fixture = Fixture::new(MockJobRepository::new(), records);
    fixture.processor.fail_on(202, "parse error: bad amount field");
    fixture.processor.fail_on(301, "parse error: truncated row");

    let config = RecoveryConfig {
        emergency_backlog_threshold: 20,
        batch_size: 5,
        max_batches_per_pass: 10,
        ..Default::default()
    };
    let orchestrator = fixture.orchestrator(config);

    let report = completed(orchestrator.run().await.unwrap());
    let phased = report.phased.expect("backlog above threshold runs phased recovery");

    let transitions = fixture.records.transitions();
    let mut seen = HashSet::new();
    for transition in &transitions {
        assert!(
            seen.insert(transition.id),
            "record {} transitioned twice",
            transition.id
        );
    }
    assert_eq!(transitions.len(), 41);
    assert_eq!(fixture.records.pending_count(), 0);

    assert_eq!(phased.total_processed, 39);
    assert_eq!(phased.total_skipped, 2);
    assert_eq!(fixture.records.get(202).unwrap().status, RecordStatus::Skipped);
    assert_eq!(fixture.records.get(203).unwrap().status, RecordStatus::Processed);

    // 第四层只收到未被前面层级覆盖的类型
    assert_eq!(
        fixture.bulk.calls(),
        vec![vec!["AD".to_string(), "CT".to_string()]]
    );

    // 快速路径先处理 pending 最多的类型
    assert_eq!(phased.phases[0].record_type_class, "DT");
    assert_eq!(phased.phases[1].record_type_class, "BH");

    let summary = fixture.log.alerts_with_category("phased_recovery_completed");
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].details["total_skipped"], 2);
}
