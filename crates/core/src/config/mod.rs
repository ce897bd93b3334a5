//! 配置管理
//!
//! 配置按 `database`、`supervisor`、`observability` 三段组织，
//! 从 TOML 文件加载并允许 `INGEST_` 前缀的环境变量覆盖。
//! 配置在启动时校验一次，运行期间只读。

pub mod models;

pub use models::{
    AlertThresholds, AppConfig, BacklogConfig, CacheConfig, DatabaseConfig, IntervalConfig,
    ObservabilityConfig, RecoveryConfig, ResourceThresholds, SupervisorConfig,
};
