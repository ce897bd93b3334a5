use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SupervisorError;

/// 入库作业
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub status: JobStatus,
    pub lease: Option<Lease>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
    pub error_text: Option<String>,
    /// 不可恢复的输入，需要重新上传
    pub requires_resubmission: bool,
    pub created_at: DateTime<Utc>,
}

/// 作业状态
///
/// ```text
/// Queued → Processing → Completed
///   ↑          ↓
///   └──────────┴──────→ Failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// 判断状态转换是否合法
    ///
    /// Processing → Queued 只允许监督器在卡住重置时使用。
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Queued)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(SupervisorError::Serialization(format!(
                "Invalid job status: {s}"
            ))),
        }
    }
}

/// 作业租约
///
/// 一个处理中的作业最多持有一个租约。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner_id: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            acquired_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.acquired_at
    }

    /// 租约是否已成为孤儿：持有者不是当前实例且持有时间超过阈值
    pub fn is_orphaned(&self, current_owner: &str, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.owner_id != current_owner && self.age(now) > threshold
    }
}

impl Job {
    pub fn new_queued(id: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            lease: None,
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            error_text: None,
            requires_resubmission: false,
            created_at,
        }
    }

    /// 是否处于处理中且开始时间早于截止时间
    pub fn is_stuck(&self, started_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.started_at.is_some_and(|started| started < started_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_status_round_trip_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_lease_orphan_detection() {
        let now = Utc::now();
        let threshold = Duration::minutes(5);

        let old_foreign = Lease::new("worker-b", now - Duration::minutes(10));
        assert!(old_foreign.is_orphaned("worker-a", now, threshold));

        let old_own = Lease::new("worker-a", now - Duration::minutes(10));
        assert!(!old_own.is_orphaned("worker-a", now, threshold));

        let fresh_foreign = Lease::new("worker-b", now - Duration::minutes(1));
        assert!(!fresh_foreign.is_orphaned("worker-a", now, threshold));
    }
}
