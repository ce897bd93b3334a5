use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use ingest_core::{
    models::{Alert, AlertLevel, MetricsSnapshotRow, PipelineSnapshot},
    traits::AlertLogSink,
};

/// 告警与指标持久化
///
/// 内存中保留最近的告警（新的在前，容量固定），每条告警同时追加到
/// 持久化日志。日志写入失败只记录错误，不影响调用方。
pub struct AlertStore {
    sink: Arc<dyn AlertLogSink>,
    recent: RwLock<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertStore {
    pub fn new(sink: Arc<dyn AlertLogSink>, capacity: usize) -> Self {
        Self {
            sink,
            recent: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// 记录一条告警
    pub async fn record(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Critical | AlertLevel::Error => {
                error!(category = alert.category(), level = %alert.level, "{}", alert.message)
            }
            AlertLevel::Warning => {
                warn!(category = alert.category(), "{}", alert.message)
            }
            AlertLevel::Info => {
                info!(category = alert.category(), "{}", alert.message)
            }
        }

        metrics::counter!(
            "supervisor_alerts_total",
            "level" => alert.level.as_str(),
            "category" => alert.category()
        )
        .increment(1);

        if let Err(e) = self.sink.append_alert(&alert.to_row()).await {
            error!("写入告警日志失败 ({}): {}", alert.category(), e);
        }

        let mut recent = self.recent.write().await;
        recent.push_front(alert);
        recent.truncate(self.capacity);
    }

    pub async fn record_all(&self, alerts: Vec<Alert>) {
        for alert in alerts {
            self.record(alert).await;
        }
    }

    /// 最近的告警，新的在前
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        self.recent.read().await.iter().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.recent.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.recent.read().await.is_empty()
    }

    /// 追加一行指标快照
    pub async fn record_metrics(&self, snapshot: &PipelineSnapshot) {
        let row = MetricsSnapshotRow::from(snapshot);
        if let Err(e) = self.sink.append_metrics(&row).await {
            error!("写入指标快照失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ingest_core::models::AlertKind;
    use ingest_testing_utils::MockAlertLog;

    fn backlog_alert(queued: u64, offset: i64) -> Alert {
        Alert::new(
            AlertLevel::Warning,
            AlertKind::QueueBacklog {
                queued,
                threshold: 50,
            },
            format!("队列积压 {queued}"),
            Utc::now() + Duration::seconds(offset),
        )
    }

    #[tokio::test]
    async fn test_history_is_capped_and_newest_first() {
        let log = MockAlertLog::new();
        let store = AlertStore::new(Arc::new(log.clone()), 100);

        for i in 0..130 {
            store.record(backlog_alert(i, i as i64)).await;
        }

        assert_eq!(store.len().await, 100);
        let recent = store.recent(3).await;
        assert_eq!(recent.len(), 3);
        assert!(matches!(recent[0].kind, AlertKind::QueueBacklog { queued: 129, .. }));
        assert!(matches!(recent[2].kind, AlertKind::QueueBacklog { queued: 127, .. }));

        let all = store.recent(usize::MAX).await;
        assert!(matches!(all[99].kind, AlertKind::QueueBacklog { queued: 30, .. }));

        // 持久化日志不受内存容量限制
        assert_eq!(log.alerts().len(), 130);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_lose_in_memory_alert() {
        let log = MockAlertLog::new();
        log.set_failing(true);
        let store = AlertStore::new(Arc::new(log.clone()), 10);

        store.record(backlog_alert(60, 0)).await;

        assert_eq!(store.len().await, 1);
        assert!(log.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_record_metrics_appends_row() {
        let log = MockAlertLog::new();
        let store = AlertStore::new(Arc::new(log.clone()), 10);

        let snapshot = PipelineSnapshot {
            pending_backlog: 12,
            queued_jobs: 3,
            ..Default::default()
        };
        store.record_metrics(&snapshot).await;

        let rows = log.metrics();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_pending, 12);
        assert_eq!(rows[0].queued_jobs, 3);
    }
}
