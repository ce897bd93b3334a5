use thiserror::Error;

/// 监督器错误类型定义
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("记录未找到: {id}")]
    RecordNotFound { id: i64 },

    #[error("记录处理错误: {0}")]
    RecordProcessing(String),

    #[error("缓存重建错误: {0}")]
    CacheRebuild(String),

    #[error("资源探测错误: {0}")]
    ResourceProbe(String),

    #[error("序列化错误: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        SupervisorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SupervisorError::JobNotFound { id: 42 };
        assert_eq!(err.to_string(), "作业未找到: 42");

        let err = SupervisorError::CacheRebuild("分区 2025 正在重建".to_string());
        assert_eq!(err.to_string(), "缓存重建错误: 分区 2025 正在重建");

    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SupervisorError = json_err.into();
        assert!(matches!(err, SupervisorError::Serialization(_)));
        assert!(err.to_string().starts_with("序列化错误"));
    }
}
