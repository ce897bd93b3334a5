use serde::{Deserialize, Serialize};

/// 恢复阶段对记录采取的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseAction {
    Processed,
    Skipped,
    Reset,
}

/// 单个恢复阶段的结果，创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPhase {
    pub phase_index: u32,
    pub record_type_class: String,
    pub records_affected: u64,
    pub action: PhaseAction,
}

impl RecoveryPhase {
    pub fn new(
        phase_index: u32,
        record_type_class: impl Into<String>,
        records_affected: u64,
        action: PhaseAction,
    ) -> Self {
        Self {
            phase_index,
            record_type_class: record_type_class.into(),
            records_affected,
            action,
        }
    }
}

/// 批量处理器的返回结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub processed: u64,
    pub warnings: u64,
    pub errors: u64,
}

/// 疑似孤儿上传
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedUpload {
    pub id: String,
    pub filename: String,
    pub status: String,
}
