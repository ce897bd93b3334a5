use ingest_core::{
    config::AlertThresholds,
    models::{Alert, AlertKind, AlertLevel, PipelineSnapshot},
};

/// 告警分析器
///
/// 按固定顺序对快照做阈值检查。同一指标先判断严重级别，再判断警告级别，
/// 每个指标每个周期最多产生一条告警。
#[derive(Debug, Clone)]
pub struct AlertAnalyzer {
    thresholds: AlertThresholds,
}

impl AlertAnalyzer {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn analyze(
        &self,
        current: &PipelineSnapshot,
        previous: Option<&PipelineSnapshot>,
    ) -> Vec<Alert> {
        let t = &self.thresholds;
        let now = current.captured_at;
        let mut alerts = Vec::new();

        if current.stuck_jobs > 0 {
            alerts.push(Alert::new(
                AlertLevel::Critical,
                AlertKind::StuckJobs {
                    count: current.stuck_jobs,
                    threshold_seconds: t.stuck_job_seconds,
                },
                format!(
                    "{} 个作业处理时间超过 {} 分钟",
                    current.stuck_jobs,
                    t.stuck_job_seconds / 60
                ),
                now,
            ));
        }

        let queued = current.queued_jobs;
        if queued > 0 && queued >= t.queue_critical {
            alerts.push(Alert::new(
                AlertLevel::Critical,
                AlertKind::QueueBacklog {
                    queued,
                    threshold: t.queue_critical,
                },
                format!("队列严重积压: {} 个作业排队", queued),
                now,
            ));
        } else if queued > 0 && queued >= t.queue_warning {
            alerts.push(Alert::new(
                AlertLevel::Warning,
                AlertKind::QueueBacklog {
                    queued,
                    threshold: t.queue_warning,
                },
                format!("队列积压: {} 个作业排队", queued),
                now,
            ));
        }

        if let Some(rate) = current.error_rate() {
            let level_threshold = if rate >= t.error_rate_critical {
                Some((AlertLevel::Critical, t.error_rate_critical))
            } else if rate >= t.error_rate_warning {
                Some((AlertLevel::Warning, t.error_rate_warning))
            } else {
                None
            };
            if let Some((level, threshold)) = level_threshold {
                alerts.push(Alert::new(
                    level,
                    AlertKind::HighErrorRate {
                        error_jobs: current.error_jobs,
                        total_jobs: current.total_jobs,
                        rate,
                        threshold,
                    },
                    format!(
                        "作业错误率 {:.1}% ({}/{})",
                        rate * 100.0,
                        current.error_jobs,
                        current.total_jobs
                    ),
                    now,
                ));
            }
        }

        if current.slow_jobs > 0 {
            alerts.push(Alert::new(
                AlertLevel::Warning,
                AlertKind::SlowProcessing {
                    slow_jobs: current.slow_jobs,
                    threshold_ms: t.slow_job_ms,
                },
                format!(
                    "{} 个作业处理耗时超过 {} 秒",
                    current.slow_jobs,
                    t.slow_job_ms / 1000
                ),
                now,
            ));
        }

        if let Some(prev) = previous.filter(|p| p.recent_throughput > 0) {
            let previous_throughput = prev.recent_throughput as f64;
            let drop = (previous_throughput - current.recent_throughput as f64) / previous_throughput;
            if drop > t.throughput_drop_fraction {
                alerts.push(Alert::new(
                    AlertLevel::Warning,
                    AlertKind::ThroughputDrop {
                        previous: prev.recent_throughput,
                        current: current.recent_throughput,
                        drop_fraction: drop,
                    },
                    format!(
                        "吞吐量下降 {:.0}%: {} -> {}",
                        drop * 100.0,
                        prev.recent_throughput,
                        current.recent_throughput
                    ),
                    now,
                ));
            }
        }

        if current.avg_processing_time_ms > t.avg_processing_ceiling_ms {
            alerts.push(Alert::new(
                AlertLevel::Info,
                AlertKind::SlowAverageProcessing {
                    avg_processing_time_ms: current.avg_processing_time_ms,
                    ceiling_ms: t.avg_processing_ceiling_ms,
                },
                format!(
                    "平均处理耗时 {:.0} ms 超过 {:.0} ms",
                    current.avg_processing_time_ms, t.avg_processing_ceiling_ms
                ),
                now,
            ));
        }

        if alerts.is_empty() && current.queued_jobs == 0 && current.stuck_jobs == 0 {
            alerts.push(Alert::new(
                AlertLevel::Info,
                AlertKind::HealthySystem {
                    total_jobs: current.total_jobs,
                    recent_throughput: current.recent_throughput,
                },
                "系统运行正常",
                now,
            ));
        }

        alerts
    }
}

/// 是否存在警告及以上级别的告警
pub fn requires_recovery(alerts: &[Alert]) -> bool {
    alerts.iter().any(|a| a.level >= AlertLevel::Warning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_testing_utils::SnapshotBuilder;

    fn analyzer() -> AlertAnalyzer {
        AlertAnalyzer::new(AlertThresholds {
            queue_warning: 50,
            queue_critical: 100,
            ..Default::default()
        })
    }

    fn categories(alerts: &[Alert]) -> Vec<&'static str> {
        alerts.iter().map(|a| a.category()).collect()
    }

    #[test]
    fn test_queue_backlog_critical_only() {
        let snapshot = SnapshotBuilder::new()
            .with_total_jobs(150)
            .with_queued(150)
            .build();

        let alerts = analyzer().analyze(&snapshot, None);

        let backlog: Vec<&Alert> = alerts
            .iter()
            .filter(|a| a.category() == "queue_backlog")
            .collect();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].level, AlertLevel::Critical);
    }

    #[test]
    fn test_queue_backlog_warning() {
        let snapshot = SnapshotBuilder::new()
            .with_total_jobs(60)
            .with_queued(60)
            .build();

        let alerts = analyzer().analyze(&snapshot, None);
        assert_eq!(categories(&alerts), vec!["queue_backlog"]);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
    }

    #[test]
    fn test_stuck_jobs_are_critical() {
        let snapshot = SnapshotBuilder::new()
            .with_total_jobs(3)
            .with_processing(3)
            .with_stuck(2)
            .build();

        let alerts = analyzer().analyze(&snapshot, None);
        assert_eq!(categories(&alerts), vec!["stuck_jobs"]);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert!(requires_recovery(&alerts));
    }

    #[test]
    fn test_error_rate_levels() {
        let critical = SnapshotBuilder::new()
            .with_total_jobs(10)
            .with_error_jobs(3)
            .build();
        let alerts = analyzer().analyze(&critical, None);
        assert_eq!(categories(&alerts), vec!["high_error_rate"]);
        assert_eq!(alerts[0].level, AlertLevel::Critical);

        let warning = SnapshotBuilder::new()
            .with_total_jobs(10)
            .with_error_jobs(1)
            .build();
        let alerts = analyzer().analyze(&warning, None);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
    }

    #[test]
    fn test_error_rate_skipped_without_jobs() {
        let snapshot = SnapshotBuilder::new().build();
        let alerts = analyzer().analyze(&snapshot, None);
        assert_eq!(categories(&alerts), vec!["healthy_system"]);
    }

    #[test]
    fn test_throughput_drop_requires_previous_throughput() {
        let previous = SnapshotBuilder::new()
            .with_total_jobs(100)
            .with_throughput(40)
            .build();
        let current = SnapshotBuilder::new()
            .with_total_jobs(100)
            .with_throughput(10)
            .build();

        let alerts = analyzer().analyze(&current, Some(&previous));
        assert_eq!(categories(&alerts), vec!["throughput_drop"]);

        let idle_previous = SnapshotBuilder::new().with_total_jobs(100).build();
        let alerts = analyzer().analyze(&current, Some(&idle_previous));
        assert_eq!(categories(&alerts), vec!["healthy_system"]);
    }

    #[test]
    fn test_slow_processing_and_average() {
        let snapshot = SnapshotBuilder::new()
            .with_total_jobs(5)
            .with_slow_jobs(2)
            .with_avg_processing_time_ms(90_000.0)
            .build();

        let alerts = analyzer().analyze(&snapshot, None);
        assert_eq!(
            categories(&alerts),
            vec!["slow_processing", "slow_average_processing"]
        );
        assert_eq!(alerts[1].level, AlertLevel::Info);
    }

    #[test]
    fn test_info_only_does_not_require_recovery() {
        let snapshot = SnapshotBuilder::new()
            .with_total_jobs(5)
            .with_avg_processing_time_ms(90_000.0)
            .build();

        let alerts = analyzer().analyze(&snapshot, None);
        assert_eq!(categories(&alerts), vec!["slow_average_processing"]);
        assert!(!requires_recovery(&alerts));
    }
}
