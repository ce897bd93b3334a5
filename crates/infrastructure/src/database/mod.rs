pub mod mapping;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ingest_core::{config::DatabaseConfig, traits::DatastoreProbe, Clock, SupervisorResult};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{debug, info};

pub use sqlite::{
    SqliteAlertLog, SqliteJobRepository, SqliteRecordRepository, SqliteRecordTransaction,
    SqliteSettingsRepository, SqliteUploadRepository,
};

/// 建表语句，全部幂等
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status TEXT NOT NULL DEFAULT 'queued',
        lease_owner TEXT,
        lease_acquired_at DATETIME,
        started_at DATETIME,
        completed_at DATETIME,
        processing_time_ms INTEGER,
        error_text TEXT,
        requires_resubmission INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        sequence_number INTEGER,
        payload TEXT,
        processed_at DATETIME,
        skip_reason TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS uploads (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        status TEXT NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alert_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        level TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '{}',
        created_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metrics_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        captured_at DATETIME NOT NULL,
        record_counts TEXT NOT NULL DEFAULT '[]',
        total_pending INTEGER NOT NULL,
        total_processed INTEGER NOT NULL,
        total_skipped INTEGER NOT NULL,
        queued_jobs INTEGER NOT NULL,
        processing_jobs INTEGER NOT NULL,
        failed_jobs INTEGER NOT NULL,
        stuck_jobs INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        partition_key TEXT NOT NULL,
        period TEXT NOT NULL,
        record_type TEXT NOT NULL,
        record_count INTEGER NOT NULL,
        refreshed_at DATETIME NOT NULL,
        PRIMARY KEY (partition_key, period, record_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_partitions (
        partition_key TEXT PRIMARY KEY,
        entry_count INTEGER NOT NULL DEFAULT 0,
        refreshed_at DATETIME
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_records_status_type ON records(status, record_type)",
    "CREATE INDEX IF NOT EXISTS idx_uploads_status ON uploads(status)",
    "CREATE INDEX IF NOT EXISTS idx_alert_log_created_at ON alert_log(created_at)",
];

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SupervisorResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
            .connect(&config.url)
            .await?;

        debug!("已连接数据库: {}", config.url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SupervisorResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("数据库表结构已就绪");
        Ok(())
    }

    pub async fn health_check(&self) -> SupervisorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn job_repository(&self) -> SqliteJobRepository {
        SqliteJobRepository::new(self.pool.clone())
    }

    pub fn record_repository(&self) -> SqliteRecordRepository {
        SqliteRecordRepository::new(self.pool.clone())
    }

    pub fn alert_log(&self) -> SqliteAlertLog {
        SqliteAlertLog::new(self.pool.clone())
    }

    pub fn settings_repository(&self) -> SqliteSettingsRepository {
        SqliteSettingsRepository::new(self.pool.clone())
    }

    pub fn upload_repository(&self, clock: Arc<dyn Clock>) -> SqliteUploadRepository {
        SqliteUploadRepository::new(self.pool.clone(), clock)
    }
}

#[async_trait]
impl DatastoreProbe for DatabaseManager {
    async fn ping(&self) -> SupervisorResult<()> {
        self.health_check().await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// 单连接的内存数据库，保证所有查询看到同一个库
    pub async fn memory_database() -> DatabaseManager {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let db = DatabaseManager::new(&config).await.unwrap();
        db.migrate().await.unwrap();
        db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent_and_ping_works() {
        let db = test_support::memory_database().await;

        db.migrate().await.unwrap();
        db.ping().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "alert_log",
                "cache_entries",
                "cache_partitions",
                "jobs",
                "metrics_snapshots",
                "records",
                "settings",
                "uploads"
            ]
        );
    }

    #[tokio::test]
    async fn test_ping_fails_after_close() {
        let db = test_support::memory_database().await;
        db.close().await;
        assert!(db.ping().await.is_err());
    }
}
