use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SupervisorError;

/// 跳过原因的最大长度
pub const MAX_SKIP_REASON_LEN: usize = 500;

/// 解析后的交易记录行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: i64,
    pub record_type: String,
    pub status: RecordStatus,
    pub sequence_number: Option<i64>,
    pub payload: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Processed,
    Skipped,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processed => "processed",
            RecordStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "processed" => Ok(RecordStatus::Processed),
            "skipped" => Ok(RecordStatus::Skipped),
            _ => Err(SupervisorError::Serialization(format!(
                "Invalid record status: {s}"
            ))),
        }
    }
}

/// 按记录类型统计的状态计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeCounts {
    pub record_type: String,
    pub pending: u64,
    pub processed: u64,
    pub skipped: u64,
}

impl RecordTypeCounts {
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            ..Default::default()
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processed + self.skipped
    }
}

/// 截断错误信息，保证按字符边界截断
pub fn truncate_reason(reason: &str, max_len: usize) -> String {
    if reason.chars().count() <= max_len {
        return reason.to_string();
    }
    let mut truncated: String = reason.chars().take(max_len.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
