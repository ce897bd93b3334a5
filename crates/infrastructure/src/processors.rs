//! 默认的记录处理器
//!
//! 字段提取属于上游解析器，这里只做结构校验和状态推进：
//! 单条处理器拒绝空内容或字段不足的记录，批量处理器按批推进 pending 记录。

use std::sync::Arc;

use async_trait::async_trait;
use ingest_core::{
    models::{BulkOutcome, PipelineRecord},
    traits::{BulkProcessor, RecordProcessor, RecordRepository},
    Clock, SupervisorError, SupervisorResult,
};
use tracing::{debug, info, warn};

use crate::database::SqliteRecordRepository;

/// 记录内容的字段分隔符
pub const FIELD_SEPARATOR: char = '|';

/// 单条记录的结构校验
#[derive(Debug, Clone)]
pub struct PayloadRecordProcessor {
    min_fields: usize,
}

impl PayloadRecordProcessor {
    pub fn new(min_fields: usize) -> Self {
        Self { min_fields }
    }
}

impl Default for PayloadRecordProcessor {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl RecordProcessor for PayloadRecordProcessor {
    async fn process(&self, record: &PipelineRecord) -> SupervisorResult<()> {
        let payload = record
            .payload
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                SupervisorError::RecordProcessing(format!("记录 {} 内容为空", record.id))
            })?;

        let fields = payload.split(FIELD_SEPARATOR).count();
        if fields < self.min_fields {
            return Err(SupervisorError::RecordProcessing(format!(
                "记录 {} 字段数不足: 期望至少 {}，实际 {}",
                record.id, self.min_fields, fields
            )));
        }

        Ok(())
    }
}

/// 基于 SQLite 的批量处理器
pub struct SqliteBulkProcessor {
    records: SqliteRecordRepository,
    clock: Arc<dyn Clock>,
}

impl SqliteBulkProcessor {
    pub fn new(records: SqliteRecordRepository, clock: Arc<dyn Clock>) -> Self {
        Self { records, clock }
    }

    async fn process_type(
        &self,
        record_type: &str,
        batch_size: usize,
        outcome: &mut BulkOutcome,
    ) -> SupervisorResult<()> {
        let skipped = self
            .records
            .skip_blank_payloads(record_type, "空记录内容", self.clock.now())
            .await?;
        if skipped > 0 {
            warn!("{} 类型跳过 {} 条空记录", record_type, skipped);
            outcome.warnings += skipped;
        }

        loop {
            let updated = self
                .records
                .mark_pending_processed(record_type, batch_size, self.clock.now())
                .await?;
            outcome.processed += updated;
            if (updated as usize) < batch_size {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BulkProcessor for SqliteBulkProcessor {
    async fn process_pending(
        &self,
        record_types: &[String],
        batch_size_hint: usize,
    ) -> SupervisorResult<BulkOutcome> {
        let batch_size = batch_size_hint.max(1);
        let mut outcome = BulkOutcome::default();

        for record_type in record_types {
            if let Err(e) = self.process_type(record_type, batch_size, &mut outcome).await {
                warn!("批量处理 {} 类型失败: {}", record_type, e);
                outcome.errors += 1;
            } else {
                debug!("{} 类型批量处理完成", record_type);
            }
        }

        info!(
            "批量处理完成: 处理 {} 条, 警告 {}, 错误 {}",
            outcome.processed, outcome.warnings, outcome.errors
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_database;
    use ingest_core::models::RecordStatus;
    use ingest_testing_utils::ManualClock;

    fn record(payload: Option<&str>) -> PipelineRecord {
        PipelineRecord {
            id: 7,
            record_type: "AD".to_string(),
            status: RecordStatus::Pending,
            sequence_number: Some(1),
            payload: payload.map(str::to_string),
            processed_at: None,
            skip_reason: None,
        }
    }

    #[tokio::test]
    async fn test_payload_processor_validation() {
        let processor = PayloadRecordProcessor::new(3);

        assert!(processor.process(&record(Some("a|b|c"))).await.is_ok());

        let err = processor.process(&record(Some("a|b"))).await.unwrap_err();
        assert!(err.to_string().contains("字段数不足"));

        let err = processor.process(&record(Some("  "))).await.unwrap_err();
        assert!(matches!(err, SupervisorError::RecordProcessing(_)));
        assert!(processor.process(&record(None)).await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_processor_drains_in_batches() {
        let db = memory_database().await;
        let records = db.record_repository();
        for i in 0..12 {
            let mut r = record(Some("a|b"));
            r.sequence_number = Some(i);
            records.insert(&r).await.unwrap();
        }
        records.insert(&record(None)).await.unwrap();
        let mut other = record(Some("x|y"));
        other.record_type = "DT".to_string();
        records.insert(&other).await.unwrap();

        let processor = SqliteBulkProcessor::new(records.clone(), Arc::new(ManualClock::fixed()));
        let outcome = processor
            .process_pending(&["AD".to_string()], 5)
            .await
            .unwrap();

        assert_eq!(outcome.processed, 12);
        assert_eq!(outcome.warnings, 1);
        assert_eq!(outcome.errors, 0);
        // 未请求的类型保持 pending
        assert_eq!(records.count_pending().await.unwrap(), 1);
    }
}
