use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use ingest_core::{
    config::ResourceThresholds,
    models::{Alert, AlertKind, AlertLevel},
    traits::{DatastoreProbe, MemoryProbe, MemoryUsage},
    Clock,
};

/// 资源监控器
///
/// 检查进程内存占比和数据存储往返延迟。同一指标同时满足警告和严重阈值时
/// 只报告严重。数据存储探测失败或超过截止时间时立即报告连接失败，
/// 不在本次检查内重试。
pub struct ResourceMonitor {
    memory_probe: Arc<dyn MemoryProbe>,
    datastore_probe: Arc<dyn DatastoreProbe>,
    clock: Arc<dyn Clock>,
    thresholds: ResourceThresholds,
}

impl ResourceMonitor {
    pub fn new(
        memory_probe: Arc<dyn MemoryProbe>,
        datastore_probe: Arc<dyn DatastoreProbe>,
        clock: Arc<dyn Clock>,
        thresholds: ResourceThresholds,
    ) -> Self {
        Self {
            memory_probe,
            datastore_probe,
            clock,
            thresholds,
        }
    }

    pub async fn check(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        alerts.extend(self.check_memory());
        alerts.extend(self.check_datastore().await);
        alerts
    }

    pub fn check_memory(&self) -> Option<Alert> {
        let usage = match self.memory_probe.sample() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("读取内存使用情况失败: {}", e);
                return None;
            }
        };

        let fraction = usage.fraction();
        metrics::gauge!("supervisor_memory_usage_fraction").set(fraction);

        let (level, threshold) = if fraction >= self.thresholds.memory_critical_fraction {
            (AlertLevel::Critical, self.thresholds.memory_critical_fraction)
        } else if fraction >= self.thresholds.memory_warning_fraction {
            (AlertLevel::Warning, self.thresholds.memory_warning_fraction)
        } else {
            debug!("内存使用 {:.1}%", fraction * 100.0);
            return None;
        };

        Some(self.memory_alert(level, usage, threshold))
    }

    fn memory_alert(&self, level: AlertLevel, usage: MemoryUsage, threshold: f64) -> Alert {
        Alert::new(
            level,
            AlertKind::HighMemoryUsage {
                heap_used_mb: usage.used_mb(),
                heap_total_mb: usage.total_mb(),
                usage_fraction: usage.fraction(),
                threshold,
            },
            format!(
                "内存使用率 {:.1}% ({} MB / {} MB)",
                usage.fraction() * 100.0,
                usage.used_mb(),
                usage.total_mb()
            ),
            self.clock.now(),
        )
    }

    pub async fn check_datastore(&self) -> Option<Alert> {
        let deadline = self.thresholds.datastore_deadline();
        let started = Instant::now();
        let result = tokio::time::timeout(deadline, self.datastore_probe.ping()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("数据存储探测超过 {} ms 未响应", deadline.as_millis())),
        };
        if let Some(error) = error {
            return Some(Alert::new(
                AlertLevel::Critical,
                AlertKind::ConnectivityFailure {
                    error: error.clone(),
                },
                format!("数据存储连接失败: {}", error),
                self.clock.now(),
            ));
        }

        metrics::histogram!("supervisor_datastore_latency_ms").record(latency_ms as f64);

        let (level, threshold_ms) = if latency_ms >= self.thresholds.latency_critical_ms {
            (AlertLevel::Critical, self.thresholds.latency_critical_ms)
        } else if latency_ms >= self.thresholds.latency_warning_ms {
            (AlertLevel::Warning, self.thresholds.latency_warning_ms)
        } else {
            debug!("数据存储延迟 {} ms", latency_ms);
            return None;
        };

        Some(Alert::new(
            level,
            AlertKind::HighDatastoreLatency {
                latency_ms,
                threshold_ms,
            },
            format!("数据存储延迟 {} ms", latency_ms),
            self.clock.now(),
        ))
    }
}
