use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ingest_core::{
    models::{Alert, CacheRebuildJob, CacheRefreshResult, QueueStatus},
    traits::{CacheRebuilder, DatastoreProbe},
    AppConfig, Clock, SystemClock,
};
use ingest_infrastructure::{
    DatabaseManager, PayloadRecordProcessor, ProcMemoryProbe, SqliteBulkProcessor,
    SqliteCacheRebuilder, SqliteSettingsRepository,
};
use ingest_supervisor::{ProcessingSupervisor, SupervisorDeps};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 组合根：连接数据库、装配协作者并持有监督器
pub struct Application {
    database: Arc<DatabaseManager>,
    settings: SqliteSettingsRepository,
    cache_rebuilder: Arc<SqliteCacheRebuilder>,
    clock: Arc<dyn Clock>,
    supervisor: Arc<ProcessingSupervisor>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化处理监督器，实例: {}", config.supervisor.instance_id);

        ensure_data_dir(&config.database.url).await?;
        let database = Arc::new(
            DatabaseManager::new(&config.database)
                .await
                .with_context(|| format!("连接数据库失败: {}", config.database.url))?,
        );
        database.migrate().await.context("初始化数据库表结构失败")?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let records = database.record_repository();
        let settings = database.settings_repository();
        let cache_rebuilder = Arc::new(SqliteCacheRebuilder::new(
            database.pool().clone(),
            clock.clone(),
        ));

        let deps = SupervisorDeps {
            job_repo: Arc::new(database.job_repository()),
            record_repo: Arc::new(records.clone()),
            alert_log: Arc::new(database.alert_log()),
            pause_flag: Arc::new(settings.clone()),
            record_processor: Arc::new(PayloadRecordProcessor::default()),
            bulk_processor: Arc::new(SqliteBulkProcessor::new(records, clock.clone())),
            upload_recovery: Arc::new(database.upload_repository(clock.clone())),
            cache_rebuilder: cache_rebuilder.clone(),
            cooldown_store: Arc::new(settings.clone()),
            datastore_probe: database.clone(),
            memory_probe: Arc::new(ProcMemoryProbe::new()),
            clock: clock.clone(),
        };

        if config.observability.metrics_enabled {
            install_metrics_exporter(config.observability.prometheus_bind_address.as_deref())?;
        }

        let supervisor = Arc::new(ProcessingSupervisor::new(config.supervisor.clone(), deps));

        Ok(Self {
            database,
            settings,
            cache_rebuilder,
            clock,
            supervisor,
        })
    }

    /// 运行监督器直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.supervisor.start().await;

        let _ = shutdown_rx.recv().await;
        info!("停止处理监督器");

        self.supervisor.stop().await;
        self.database.close().await;
        Ok(())
    }

    /// 执行一次完整健康检查
    pub async fn check(&self) -> Vec<Alert> {
        self.supervisor.force_health_check().await
    }

    pub async fn status(&self) -> QueueStatus {
        self.supervisor.queue_status().await
    }

    /// 数据库往返耗时
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.database.ping().await.context("数据库探测失败")?;
        Ok(started.elapsed())
    }

    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.settings
            .set_paused(paused, self.clock.now())
            .await
            .context("更新暂停开关失败")?;
        info!("处理暂停开关已设置为 {}", paused);
        Ok(())
    }

    /// 请求重建缓存分区，被接受时等待重建结束
    pub async fn rebuild_cache(
        &self,
        partition_key: &str,
        requested_by: &str,
    ) -> Result<(CacheRefreshResult, Option<CacheRebuildJob>)> {
        let result = self
            .supervisor
            .start_cache_refresh(partition_key, requested_by)
            .await;
        if !result.success {
            return Ok((result, None));
        }

        loop {
            let job = self
                .cache_rebuilder
                .active_jobs()
                .await
                .context("查询缓存重建进度失败")?
                .into_iter()
                .find(|job| job.partition_key == partition_key);

            match job {
                Some(job) if job.is_running() => {
                    info!(
                        "缓存分区 {} 重建进度 {:.0}%",
                        partition_key,
                        job.progress_percent()
                    );
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                other => return Ok((result, other)),
            }
        }
    }

    pub async fn close(&self) {
        self.database.close().await;
    }
}

/// 文件数据库的父目录不存在时先创建
async fn ensure_data_dir(url: &str) -> Result<()> {
    let Some(path) = sqlite_file_path(url) else {
        return Ok(());
    };

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建数据目录失败: {}", parent.display()))?;
        }
    }
    Ok(())
}

fn sqlite_file_path(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

fn install_metrics_exporter(bind_address: Option<&str>) -> Result<()> {
    let Some(address) = bind_address else {
        warn!("未配置 Prometheus 导出地址，指标不会对外暴露");
        return Ok(());
    };

    let address: std::net::SocketAddr = address
        .parse()
        .with_context(|| format!("无效的Prometheus导出地址: {address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .context("启动Prometheus导出器失败")?;

    info!("Prometheus 指标导出地址: {}", address);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::{config::DatabaseConfig, traits::PauseFlag};

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(
            sqlite_file_path("sqlite://data/ingest.db?mode=rwc"),
            Some("data/ingest.db")
        );
        assert_eq!(sqlite_file_path("sqlite:ingest.db"), Some("ingest.db"));
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://localhost/db"), None);
    }

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.database = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            connection_timeout_seconds: 5,
            idle_timeout_seconds: 60,
        };
        config.observability.metrics_enabled = false;
        config
    }

    #[tokio::test]
    async fn test_application_wires_collaborators() {
        let app = Application::new(memory_config()).await.unwrap();

        assert!(app.ping().await.is_ok());
        let status = app.status().await;
        assert_eq!(status.waiting, 0);
        assert!(!status.is_busy);

        app.set_paused(true).await.unwrap();
        assert!(app.settings.is_paused().await.unwrap());

        let (result, job) = app.rebuild_cache("2025", "ops").await.unwrap();
        assert!(result.success);
        assert_eq!(job.unwrap().completed_units, 12);

        // 冷却期内第二次请求被拒绝
        let (result, job) = app.rebuild_cache("2025", "ops").await.unwrap();
        assert!(!result.success);
        assert!(job.is_none());

        app.close().await;
    }

    #[tokio::test]
    async fn test_rebuild_cooldown_spans_processes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config();
        config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("ingest.db").display());

        // 常驻进程和一次性管理命令各自打开同一个数据库
        let daemon = Application::new(config.clone()).await.unwrap();
        let (result, job) = daemon.rebuild_cache("2025", "daemon").await.unwrap();
        assert!(result.success, "{}", result.message);
        assert_eq!(job.unwrap().completed_units, 12);

        let admin = Application::new(config).await.unwrap();
        let (result, job) = admin.rebuild_cache("2025", "ops").await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("冷却"), "{}", result.message);
        assert!(job.is_none());

        admin.close().await;
        daemon.close().await;
    }

    #[tokio::test]
    async fn test_ensure_data_dir_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested/ingest.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        ensure_data_dir(&url).await.unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
