//! SQLite 行映射的公共辅助函数

use std::str::FromStr;

use ingest_core::{SupervisorError, SupervisorResult};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub struct MappingHelpers;

impl MappingHelpers {
    /// 读取以文本存储的枚举列
    pub fn parse_enum<T>(row: &SqliteRow, field_name: &str) -> SupervisorResult<T>
    where
        T: FromStr<Err = SupervisorError>,
    {
        let value: String = row.try_get(field_name)?;
        value.parse()
    }

    /// 读取以 JSON 文本存储的列
    pub fn parse_json<T: DeserializeOwned>(
        row: &SqliteRow,
        field_name: &str,
    ) -> SupervisorResult<T> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SupervisorError::Serialization(format!("解析 {field_name} 失败: {e}")))
    }

    /// 读取计数列，SUM 在空集上返回 NULL
    pub fn count(row: &SqliteRow, field_name: &str) -> SupervisorResult<u64> {
        let value: Option<i64> = row.try_get(field_name)?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    /// 生成 `?, ?, ?` 形式的占位符
    pub fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(MappingHelpers::placeholders(3), "?, ?, ?");
        assert_eq!(MappingHelpers::placeholders(1), "?");
    }
}
