pub mod app_config;
pub mod database;
pub mod observability;
pub mod supervisor;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use observability::ObservabilityConfig;
pub use supervisor::{
    AlertThresholds, BacklogConfig, CacheConfig, IntervalConfig, RecoveryConfig,
    ResourceThresholds, SupervisorConfig,
};
