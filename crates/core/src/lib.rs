//! 批量入库流水线处理监督器的核心库
//!
//! 提供领域模型、配置、错误类型以及监督器与外部协作者之间的接口。

pub mod clock;
pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use clock::{Clock, SystemClock};
pub use config::*;
pub use errors::*;

/// 统一的Result类型
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
