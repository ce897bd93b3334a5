//! Mock implementations for all repository and collaborator traits
//!
//! In-memory implementations with the same conditional-update semantics as
//! the SQLite repositories, so supervisor logic can be unit tested without a
//! database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::models::{
    AlertRow, BulkOutcome, CachePartitionStatus, CacheRebuildJob, CacheRebuildStatus, Job,
    JobStatus, Lease, MetricsSnapshotRow, OrphanedUpload, PipelineRecord, RecordStatus,
    RecordTypeCounts,
};
use ingest_core::traits::{
    AlertLogSink, BulkProcessor, CacheRebuilder, CompletedJobStats, DatastoreProbe,
    JobRepository, MemoryProbe, MemoryUsage, PauseFlag, RebuildCooldownStore, RecordProcessor,
    RecordRepository, RecordTransaction, UploadRecovery,
};
use ingest_core::{SupervisorError, SupervisorResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn injected_failure() -> SupervisorError {
    SupervisorError::DatabaseOperation("injected failure".to_string())
}

/// Mock implementation of JobRepository for testing
#[derive(Debug, Clone)]
pub struct MockJobRepository {
    jobs: Arc<Mutex<BTreeMap<i64, Job>>>,
    next_id: Arc<Mutex<i64>>,
    failing: Arc<AtomicBool>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(Mutex::new(1)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        let repo = Self::new();
        let max_id = jobs.iter().map(|j| j.id).max().unwrap_or(0);
        {
            let mut map = repo.jobs.lock().unwrap();
            for job in jobs {
                map.insert(job.id, job);
            }
        }
        *repo.next_id.lock().unwrap() = max_id + 1;
        repo
    }

    /// Make every call fail with a datastore error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, id: i64) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn get_all_jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn check(&self) -> SupervisorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(injected_failure())
        } else {
            Ok(())
        }
    }
}

impl Default for MockJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn create(&self, job: &Job) -> SupervisorResult<Job> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut new_job = job.clone();
        new_job.id = *next_id;
        new_job.status = JobStatus::Queued;
        *next_id += 1;

        jobs.insert(new_job.id, new_job.clone());
        Ok(new_job)
    }

    async fn get_by_id(&self, id: i64) -> SupervisorResult<Option<Job>> {
        self.check()?;
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn count_all(&self) -> SupervisorResult<u64> {
        self.check()?;
        Ok(self.jobs.lock().unwrap().len() as u64)
    }

    async fn count_by_status(&self, status: JobStatus) -> SupervisorResult<u64> {
        self.check()?;
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.values().filter(|j| j.status == status).count() as u64)
    }

    async fn count_stuck(&self, started_before: DateTime<Utc>) -> SupervisorResult<u64> {
        self.check()?;
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.values().filter(|j| j.is_stuck(started_before)).count() as u64)
    }

    async fn completed_stats_since(
        &self,
        since: DateTime<Utc>,
        slow_threshold_ms: i64,
    ) -> SupervisorResult<CompletedJobStats> {
        self.check()?;
        let jobs = self.jobs.lock().unwrap();
        let recent: Vec<&Job> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Completed && j.completed_at.is_some_and(|c| c >= since)
            })
            .collect();

        let times: Vec<i64> = recent.iter().filter_map(|j| j.processing_time_ms).collect();
        let avg = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<i64>() as f64 / times.len() as f64
        };

        Ok(CompletedJobStats {
            completed: recent.len() as u64,
            avg_processing_time_ms: avg,
            slow: times.iter().filter(|t| **t > slow_threshold_ms).count() as u64,
        })
    }

    async fn try_claim(
        &self,
        id: i64,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> SupervisorResult<bool> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Processing;
                job.lease = Some(Lease::new(owner_id, now));
                job.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: i64,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> SupervisorResult<bool> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.lease.as_ref().is_some_and(|l| l.owner_id == owner_id) =>
            {
                job.status = JobStatus::Completed;
                job.lease = None;
                job.completed_at = Some(now);
                job.processing_time_ms = job
                    .started_at
                    .map(|started| (now - started).num_milliseconds());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_with_error(
        &self,
        id: i64,
        owner_id: &str,
        error_text: &str,
    ) -> SupervisorResult<bool> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.lease.as_ref().is_some_and(|l| l.owner_id == owner_id) =>
            {
                job.status = JobStatus::Queued;
                job.lease = None;
                job.started_at = None;
                job.error_text = Some(error_text.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stuck_jobs(&self, started_before: DateTime<Utc>) -> SupervisorResult<u64> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let mut affected = 0;
        for job in jobs.values_mut().filter(|j| j.is_stuck(started_before)) {
            job.status = JobStatus::Queued;
            job.lease = None;
            job.started_at = None;
            affected += 1;
        }
        Ok(affected)
    }

    async fn release_orphaned_leases(
        &self,
        current_owner: &str,
        acquired_before: DateTime<Utc>,
    ) -> SupervisorResult<u64> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let mut affected = 0;
        for job in jobs.values_mut() {
            let orphaned = job.status == JobStatus::Processing
                && job.lease.as_ref().is_some_and(|l| {
                    l.owner_id != current_owner && l.acquired_at < acquired_before
                });
            if orphaned {
                job.status = JobStatus::Queued;
                job.lease = None;
                job.started_at = None;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn fail_unrecoverable_jobs(&self, markers: &[String]) -> SupervisorResult<u64> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let mut affected = 0;
        for job in jobs.values_mut() {
            let matches = job.status == JobStatus::Queued
                && job.error_text.as_ref().is_some_and(|text| {
                    let lower = text.to_lowercase();
                    markers.iter().any(|m| lower.contains(&m.to_lowercase()))
                });
            if matches {
                job.status = JobStatus::Failed;
                job.requires_resubmission = true;
                affected += 1;
            }
        }
        Ok(affected)
    }
}

/// 一次记录状态转换
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTransition {
    pub id: i64,
    pub to: RecordStatus,
}

/// Mock implementation of RecordRepository for testing
///
/// Every pending → processed/skipped transition is appended to a log so
/// tests can assert that no record moves twice.
#[derive(Debug, Clone)]
pub struct MockRecordRepository {
    records: Arc<Mutex<BTreeMap<i64, PipelineRecord>>>,
    transitions: Arc<Mutex<Vec<RecordTransition>>>,
    next_id: Arc<Mutex<i64>>,
    failing: Arc<AtomicBool>,
}

impl MockRecordRepository {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            transitions: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(Mutex::new(1)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_records(records: Vec<PipelineRecord>) -> Self {
        let repo = Self::new();
        let max_id = records.iter().map(|r| r.id).max().unwrap_or(0);
        {
            let mut map = repo.records.lock().unwrap();
            for record in records {
                map.insert(record.id, record);
            }
        }
        *repo.next_id.lock().unwrap() = max_id + 1;
        repo
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, id: i64) -> Option<PipelineRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    pub fn transitions(&self) -> Vec<RecordTransition> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn pending_count(&self) -> u64 {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == RecordStatus::Pending)
            .count() as u64
    }

    /// 把指定类型的全部 pending 记录标记为 processed，返回数量
    pub fn drain_type(&self, record_type: &str, now: DateTime<Utc>) -> u64 {
        let ids: Vec<i64> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == RecordStatus::Pending && r.record_type == record_type)
            .map(|r| r.id)
            .collect();
        ids.into_iter()
            .filter(|id| self.transition(*id, RecordStatus::Processed, None, now))
            .count() as u64
    }

    fn transition(
        &self,
        id: i64,
        to: RecordStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&id) {
            Some(record) if record.status == RecordStatus::Pending => {
                record.status = to;
                record.processed_at = Some(now);
                record.skip_reason = reason.map(str::to_string);
                self.transitions
                    .lock()
                    .unwrap()
                    .push(RecordTransition { id, to });
                true
            }
            _ => false,
        }
    }

    fn check(&self) -> SupervisorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(injected_failure())
        } else {
            Ok(())
        }
    }
}

impl Default for MockRecordRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Mock transaction: staged ids are applied on commit, dropped on rollback
pub struct MockRecordTransaction {
    repo: MockRecordRepository,
    staged: Vec<(i64, DateTime<Utc>)>,
}

#[async_trait]
impl RecordTransaction for MockRecordTransaction {
    async fn mark_processed(&mut self, id: i64, now: DateTime<Utc>) -> SupervisorResult<bool> {
        let pending = self
            .repo
            .get(id)
            .is_some_and(|r| r.status == RecordStatus::Pending);
        if !pending || self.staged.iter().any(|(staged, _)| *staged == id) {
            return Ok(false);
        }
        self.staged.push((id, now));
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> SupervisorResult<()> {
        for (id, now) in &self.staged {
            self.repo.transition(*id, RecordStatus::Processed, None, *now);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SupervisorResult<()> {
        Ok(())
    }
}

#[async_trait]
impl RecordRepository for MockRecordRepository {
    async fn insert(&self, record: &PipelineRecord) -> SupervisorResult<PipelineRecord> {
        self.check()?;
        let mut records = self.records.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut new_record = record.clone();
        new_record.id = *next_id;
        *next_id += 1;

        records.insert(new_record.id, new_record.clone());
        Ok(new_record)
    }

    async fn get_by_id(&self, id: i64) -> SupervisorResult<Option<PipelineRecord>> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn count_pending(&self) -> SupervisorResult<u64> {
        self.check()?;
        Ok(self.pending_count())
    }

    async fn counts_by_type(&self) -> SupervisorResult<Vec<RecordTypeCounts>> {
        self.check()?;
        let records = self.records.lock().unwrap();
        let mut counts: BTreeMap<String, RecordTypeCounts> = BTreeMap::new();
        for record in records.values() {
            let entry = counts
                .entry(record.record_type.clone())
                .or_insert_with(|| RecordTypeCounts::new(record.record_type.clone()));
            match record.status {
                RecordStatus::Pending => entry.pending += 1,
                RecordStatus::Processed => entry.processed += 1,
                RecordStatus::Skipped => entry.skipped += 1,
            }
        }
        Ok(counts.into_values().collect())
    }

    async fn mark_pending_processed(
        &self,
        record_type: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SupervisorResult<u64> {
        self.check()?;
        let ids: Vec<i64> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == RecordStatus::Pending && r.record_type == record_type)
            .take(limit)
            .map(|r| r.id)
            .collect();
        Ok(ids
            .into_iter()
            .filter(|id| self.transition(*id, RecordStatus::Processed, None, now))
            .count() as u64)
    }

    async fn list_pending(
        &self,
        record_types: &[String],
        limit: usize,
    ) -> SupervisorResult<Vec<PipelineRecord>> {
        self.check()?;
        let records = self.records.lock().unwrap();
        let mut pending: Vec<PipelineRecord> = records
            .values()
            .filter(|r| r.status == RecordStatus::Pending && record_types.contains(&r.record_type))
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.sequence_number.unwrap_or(i64::MAX), r.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_skipped(
        &self,
        id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SupervisorResult<bool> {
        self.check()?;
        Ok(self.transition(id, RecordStatus::Skipped, Some(reason), now))
    }

    async fn begin(&self) -> SupervisorResult<Box<dyn RecordTransaction>> {
        self.check()?;
        Ok(Box::new(MockRecordTransaction {
            repo: self.clone(),
            staged: Vec::new(),
        }))
    }
}

/// Mock alert/metrics log that keeps every appended row
#[derive(Debug, Clone, Default)]
pub struct MockAlertLog {
    alerts: Arc<Mutex<Vec<AlertRow>>>,
    metrics: Arc<Mutex<Vec<MetricsSnapshotRow>>>,
    failing: Arc<AtomicBool>,
}

impl MockAlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<AlertRow> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn alerts_with_category(&self, category: &str) -> Vec<AlertRow> {
        self.alerts()
            .into_iter()
            .filter(|a| a.category == category)
            .collect()
    }

    pub fn metrics(&self) -> Vec<MetricsSnapshotRow> {
        self.metrics.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertLogSink for MockAlertLog {
    async fn append_alert(&self, row: &AlertRow) -> SupervisorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        self.alerts.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn append_metrics(&self, row: &MetricsSnapshotRow) -> SupervisorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        self.metrics.lock().unwrap().push(row.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockPauseFlag {
    paused: Arc<AtomicBool>,
}

impl MockPauseFlag {
    pub fn new(paused: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(paused)),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

#[async_trait]
impl PauseFlag for MockPauseFlag {
    async fn is_paused(&self) -> SupervisorResult<bool> {
        Ok(self.paused.load(Ordering::SeqCst))
    }
}

/// Mock cooldown store; clones share one timestamp, like two processes on one database
#[derive(Debug, Clone, Default)]
pub struct MockRebuildCooldownStore {
    triggered_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl MockRebuildCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggered_at(&self) -> Option<DateTime<Utc>> {
        *self.triggered_at.lock().unwrap()
    }
}

#[async_trait]
impl RebuildCooldownStore for MockRebuildCooldownStore {
    async fn last_triggered_at(&self) -> SupervisorResult<Option<DateTime<Utc>>> {
        Ok(self.triggered_at())
    }

    async fn swap_triggered_at(
        &self,
        expected: Option<DateTime<Utc>>,
        value: Option<DateTime<Utc>>,
    ) -> SupervisorResult<bool> {
        let mut current = self.triggered_at.lock().unwrap();
        if *current != expected {
            return Ok(false);
        }
        *current = value;
        Ok(true)
    }
}

/// Mock per-record processor; configured ids fail with a fixed message
#[derive(Debug, Clone, Default)]
pub struct MockRecordProcessor {
    failures: Arc<Mutex<HashMap<i64, String>>>,
    processed: Arc<Mutex<Vec<i64>>>,
    panic_on: Arc<Mutex<HashSet<i64>>>,
}

impl MockRecordProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, id: i64, message: impl Into<String>) {
        self.failures.lock().unwrap().insert(id, message.into());
    }

    pub fn panic_on(&self, id: i64) {
        self.panic_on.lock().unwrap().insert(id);
    }

    pub fn processed_ids(&self) -> Vec<i64> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordProcessor for MockRecordProcessor {
    async fn process(&self, record: &PipelineRecord) -> SupervisorResult<()> {
        if self.panic_on.lock().unwrap().contains(&record.id) {
            panic!("processor panicked on record {}", record.id);
        }
        if let Some(message) = self.failures.lock().unwrap().get(&record.id) {
            return Err(SupervisorError::RecordProcessing(message.clone()));
        }
        self.processed.lock().unwrap().push(record.id);
        Ok(())
    }
}

/// Mock bulk processor that drains the given types from a MockRecordRepository
#[derive(Debug, Clone)]
pub struct MockBulkProcessor {
    records: MockRecordRepository,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    warnings: Arc<AtomicUsize>,
}

impl MockBulkProcessor {
    pub fn new(records: MockRecordRepository) -> Self {
        Self {
            records,
            calls: Arc::new(Mutex::new(Vec::new())),
            warnings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 每次调用报告的警告数
    pub fn set_warnings(&self, warnings: usize) {
        self.warnings.store(warnings, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BulkProcessor for MockBulkProcessor {
    async fn process_pending(
        &self,
        record_types: &[String],
        _batch_size_hint: usize,
    ) -> SupervisorResult<BulkOutcome> {
        self.calls.lock().unwrap().push(record_types.to_vec());
        let now = Utc::now();
        let processed = record_types
            .iter()
            .map(|t| self.records.drain_type(t, now))
            .sum();
        Ok(BulkOutcome {
            processed,
            warnings: self.warnings.load(Ordering::SeqCst) as u64,
            errors: 0,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockUploadRecovery {
    orphans: Arc<Mutex<Vec<OrphanedUpload>>>,
    recovered: Arc<Mutex<Vec<String>>>,
}

impl MockUploadRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orphans(orphans: Vec<OrphanedUpload>) -> Self {
        let mock = Self::default();
        *mock.orphans.lock().unwrap() = orphans;
        mock
    }

    pub fn recovered_ids(&self) -> Vec<String> {
        self.recovered.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadRecovery for MockUploadRecovery {
    async fn find_orphaned_uploads(
        &self,
        _stale_before: DateTime<Utc>,
    ) -> SupervisorResult<Vec<OrphanedUpload>> {
        Ok(self.orphans.lock().unwrap().clone())
    }

    async fn recover(&self, ids: &[String]) -> SupervisorResult<u64> {
        let mut orphans = self.orphans.lock().unwrap();
        let before = orphans.len();
        orphans.retain(|o| !ids.contains(&o.id));
        self.recovered.lock().unwrap().extend(ids.iter().cloned());
        Ok((before - orphans.len()) as u64)
    }
}

/// Mock cache rebuilder; jobs stay in the running state until changed by the test
#[derive(Debug, Clone, Default)]
pub struct MockCacheRebuilder {
    jobs: Arc<Mutex<BTreeMap<String, CacheRebuildJob>>>,
    partitions: Arc<Mutex<Vec<CachePartitionStatus>>>,
    started: Arc<Mutex<Vec<String>>>,
    fail_start: Arc<AtomicBool>,
    fail_queries: Arc<AtomicBool>,
}

impl MockCacheRebuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(partitions: Vec<CachePartitionStatus>) -> Self {
        let mock = Self::default();
        *mock.partitions.lock().unwrap() = partitions;
        mock
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// 查询作业和分区状态时返回错误
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn set_job_status(&self, partition_key: &str, status: CacheRebuildStatus, error: Option<&str>) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(partition_key) {
            job.status = status;
            job.error = error.map(str::to_string);
            if status == CacheRebuildStatus::Completed {
                job.completed_units = job.total_units;
            }
        }
    }

    pub fn insert_job(&self, job: CacheRebuildJob) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job.partition_key.clone(), job);
    }
}

#[async_trait]
impl CacheRebuilder for MockCacheRebuilder {
    async fn start(&self, partition_key: &str) -> SupervisorResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SupervisorError::CacheRebuild("injected failure".to_string()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.get(partition_key).is_some_and(|j| j.is_running()) {
            return Err(SupervisorError::CacheRebuild(format!(
                "分区 {partition_key} 正在重建"
            )));
        }
        let mut job = CacheRebuildJob::new(partition_key, 12);
        job.status = CacheRebuildStatus::Running;
        jobs.insert(partition_key.to_string(), job);
        self.started.lock().unwrap().push(partition_key.to_string());
        Ok(())
    }

    async fn active_jobs(&self) -> SupervisorResult<Vec<CacheRebuildJob>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }

    async fn cleanup_completed(&self) -> SupervisorResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| j.is_running());
        Ok((before - jobs.len()) as u64)
    }

    async fn partition_statuses(&self) -> SupervisorResult<Vec<CachePartitionStatus>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        Ok(self.partitions.lock().unwrap().clone())
    }
}

/// Mock datastore probe with configurable latency and failure
#[derive(Debug, Clone, Default)]
pub struct MockDatastoreProbe {
    delay: Arc<Mutex<Duration>>,
    failing: Arc<AtomicBool>,
    pings: Arc<AtomicUsize>,
}

impl MockDatastoreProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        let probe = Self::default();
        probe.set_delay(delay);
        probe
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatastoreProbe for MockDatastoreProbe {
    async fn ping(&self) -> SupervisorResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SupervisorError::DatabaseOperation(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MockMemoryProbe {
    usage: Arc<Mutex<MemoryUsage>>,
    panicking: Arc<AtomicBool>,
}

impl MockMemoryProbe {
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            usage: Arc::new(Mutex::new(MemoryUsage {
                used_bytes,
                total_bytes,
            })),
            panicking: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_usage(&self, used_bytes: u64, total_bytes: u64) {
        *self.usage.lock().unwrap() = MemoryUsage {
            used_bytes,
            total_bytes,
        };
    }

    /// 采样时直接 panic，用于验证任务边界的异常捕获
    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    /// 按比例构造，总内存固定为 1000 MB
    pub fn with_fraction(fraction: f64) -> Self {
        let total = 1000 * 1024 * 1024u64;
        Self::new((total as f64 * fraction).round() as u64, total)
    }
}

impl Default for MockMemoryProbe {
    fn default() -> Self {
        Self::with_fraction(0.25)
    }
}

impl MemoryProbe for MockMemoryProbe {
    fn sample(&self) -> SupervisorResult<MemoryUsage> {
        if self.panicking.load(Ordering::SeqCst) {
            panic!("memory probe panicked");
        }
        Ok(*self.usage.lock().unwrap())
    }
}
