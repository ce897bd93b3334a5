use ingest_core::{traits::MemoryProbe, traits::MemoryUsage, SupervisorError, SupervisorResult};

/// 基于 procfs 的内存探测：进程 RSS 对比系统总内存
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemoryProbe;

impl ProcMemoryProbe {
    pub fn new() -> Self {
        Self
    }

    #[cfg(target_os = "linux")]
    fn read_usage() -> SupervisorResult<MemoryUsage> {
        use std::fs;

        let status = fs::read_to_string("/proc/self/status")
            .map_err(|e| SupervisorError::ResourceProbe(format!("读取 /proc/self/status 失败: {e}")))?;
        let meminfo = fs::read_to_string("/proc/meminfo")
            .map_err(|e| SupervisorError::ResourceProbe(format!("读取 /proc/meminfo 失败: {e}")))?;

        Ok(MemoryUsage {
            used_bytes: parse_kb_field(&status, "VmRSS")? * 1024,
            total_bytes: parse_kb_field(&meminfo, "MemTotal")? * 1024,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn read_usage() -> SupervisorResult<MemoryUsage> {
        Err(SupervisorError::ResourceProbe(
            "当前平台不支持内存探测".to_string(),
        ))
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn sample(&self) -> SupervisorResult<MemoryUsage> {
        Self::read_usage()
    }
}

/// 解析形如 `VmRSS:   123456 kB` 的字段，返回 kB 数值
pub fn parse_kb_field(text: &str, field: &str) -> SupervisorResult<u64> {
    let prefix = format!("{field}:");
    let line = text
        .lines()
        .find(|line| line.starts_with(&prefix))
        .ok_or_else(|| SupervisorError::ResourceProbe(format!("缺少字段 {field}")))?;

    line[prefix.len()..]
        .split_whitespace()
        .next()
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| SupervisorError::ResourceProbe(format!("字段 {field} 格式无效: {line}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tingest-watchdog\nVmPeak:\t  204800 kB\nVmRSS:\t   51200 kB\nThreads:\t8\n";
    const MEMINFO: &str = "MemTotal:       16384000 kB\nMemFree:         8192000 kB\n";

    #[test]
    fn test_parse_kb_field() {
        assert_eq!(parse_kb_field(STATUS, "VmRSS").unwrap(), 51200);
        assert_eq!(parse_kb_field(MEMINFO, "MemTotal").unwrap(), 16384000);
    }

    #[test]
    fn test_parse_kb_field_missing_or_malformed() {
        assert!(parse_kb_field(MEMINFO, "VmRSS").is_err());
        assert!(parse_kb_field("VmRSS:\tlots kB\n", "VmRSS").is_err());
        // 前缀相同的其他字段不能被误匹配
        assert!(parse_kb_field("VmRSSx:\t1 kB\n", "VmRSS").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_reads_live_values() {
        let usage = ProcMemoryProbe::new().sample().unwrap();
        assert!(usage.used_bytes > 0);
        assert!(usage.total_bytes >= usage.used_bytes);
    }
}
