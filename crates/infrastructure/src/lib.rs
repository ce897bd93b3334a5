//! 监督器协作者接口的 SQLite 实现

pub mod cache_rebuilder;
pub mod database;
pub mod processors;
pub mod resource_monitor;

pub use cache_rebuilder::SqliteCacheRebuilder;
pub use database::*;
pub use processors::{PayloadRecordProcessor, SqliteBulkProcessor};
pub use resource_monitor::ProcMemoryProbe;
