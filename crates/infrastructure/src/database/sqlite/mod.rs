pub mod sqlite_alert_log;
pub mod sqlite_job_repository;
pub mod sqlite_record_repository;
pub mod sqlite_settings_repository;
pub mod sqlite_upload_repository;

pub use sqlite_alert_log::SqliteAlertLog;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_record_repository::{SqliteRecordRepository, SqliteRecordTransaction};
pub use sqlite_settings_repository::{SqliteSettingsRepository, PROCESSING_PAUSED_KEY};
pub use sqlite_upload_repository::SqliteUploadRepository;
