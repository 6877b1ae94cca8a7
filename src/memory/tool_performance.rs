//! 工具性能日志
//!
//! 每次工具调用后追加一条 {timestamp, tool_name, succeeded, latency}；JSONL 文件可被多个会话并发追加。
//! summary 取最近 N 条汇总为调用数、错误率、平均耗时、分工具统计与最近错误，供感知阶段参考。

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 汇总中保留的最近错误条数
const RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPerfRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub tool_name: String,
    pub succeeded: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerToolSummary {
    pub calls: usize,
    pub errors: usize,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentError {
    pub tool_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPerformanceSummary {
    pub total_calls: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub per_tool: BTreeMap<String, PerToolSummary>,
    pub recent_errors: Vec<RecentError>,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// 汇总一批记录
pub fn summarize(records: &[ToolPerfRecord]) -> ToolPerformanceSummary {
    let total = records.len();
    if total == 0 {
        return ToolPerformanceSummary::default();
    }

    let mut per_tool: BTreeMap<String, PerToolSummary> = BTreeMap::new();
    let mut latency_sum: BTreeMap<String, u64> = BTreeMap::new();
    let mut errors = 0usize;
    let mut recent_errors = Vec::new();

    for record in records {
        let entry = per_tool.entry(record.tool_name.clone()).or_default();
        entry.calls += 1;
        *latency_sum.entry(record.tool_name.clone()).or_default() += record.latency_ms;
        if !record.succeeded {
            entry.errors += 1;
            errors += 1;
            if let Some(error) = &record.error {
                recent_errors.push(RecentError {
                    tool_name: record.tool_name.clone(),
                    error: error.clone(),
                });
            }
        }
    }

    for (name, stats) in per_tool.iter_mut() {
        let sum = latency_sum.get(name).copied().unwrap_or(0);
        stats.avg_latency_ms = round_to(sum as f64 / stats.calls as f64, 2);
    }

    let total_latency: u64 = records.iter().map(|r| r.latency_ms).sum();
    let skip = recent_errors.len().saturating_sub(RECENT_ERRORS);

    ToolPerformanceSummary {
        total_calls: total,
        error_rate: round_to(errors as f64 / total as f64, 3),
        avg_latency_ms: round_to(total_latency as f64 / total as f64, 2),
        per_tool,
        recent_errors: recent_errors.into_iter().skip(skip).collect(),
    }
}

/// 工具性能日志接口
pub trait ToolPerfSink: Send + Sync {
    fn append(&self, record: &ToolPerfRecord) -> Result<(), AgentError>;

    /// 最近 max_entries 条（按写入顺序）；0 表示全部
    fn recent(&self, max_entries: usize) -> Result<Vec<ToolPerfRecord>, AgentError>;

    fn summary(&self, max_entries: usize) -> Result<ToolPerformanceSummary, AgentError> {
        Ok(summarize(&self.recent(max_entries)?))
    }
}

fn tail<T>(mut items: Vec<T>, max_entries: usize) -> Vec<T> {
    if max_entries > 0 && items.len() > max_entries {
        items.drain(..items.len() - max_entries);
    }
    items
}

/// JSONL 文件实现（一行一条记录，只追加）
#[derive(Debug)]
pub struct JsonlToolPerfLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlToolPerfLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ToolPerfSink for JsonlToolPerfLog {
    fn append(&self, record: &ToolPerfRecord) -> Result<(), AgentError> {
        let line = serde_json::to_string(record)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| AgentError::Storage(format!("tool log lock poisoned: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn recent(&self, max_entries: usize) -> Result<Vec<ToolPerfRecord>, AgentError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        // 损坏的行跳过，不影响汇总
        let records: Vec<ToolPerfRecord> = data
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        Ok(tail(records, max_entries))
    }
}

/// 内存实现（测试与 dry-run 回放）
#[derive(Debug, Default)]
pub struct InMemoryToolPerfLog {
    records: RwLock<Vec<ToolPerfRecord>>,
}

impl InMemoryToolPerfLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolPerfSink for InMemoryToolPerfLog {
    fn append(&self, record: &ToolPerfRecord) -> Result<(), AgentError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| AgentError::Storage(format!("tool log lock poisoned: {e}")))?;
        records.push(record.clone());
        Ok(())
    }

    fn recent(&self, max_entries: usize) -> Result<Vec<ToolPerfRecord>, AgentError> {
        let records = self
            .records
            .read()
            .map_err(|e| AgentError::Storage(format!("tool log lock poisoned: {e}")))?;
        Ok(tail(records.clone(), max_entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tool: &str, ok: bool, latency: u64) -> ToolPerfRecord {
        ToolPerfRecord {
            timestamp: Utc::now(),
            session_id: "s".into(),
            tool_name: tool.into(),
            succeeded: ok,
            latency_ms: latency,
            error: (!ok).then(|| format!("{tool} broke")),
        }
    }

    #[test]
    fn test_summary_of_empty_log() {
        let summary = summarize(&[]);
        assert_eq!(summary.total_calls, 0);
        assert_eq!(summary.error_rate, 0.0);
        assert!(summary.per_tool.is_empty());
    }

    #[test]
    fn test_summary_counts_errors_and_latency() {
        let records = vec![
            record("search", true, 100),
            record("search", false, 300),
            record("echo", true, 2),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.error_rate, 0.333);
        assert_eq!(summary.avg_latency_ms, 134.0);
        assert_eq!(summary.per_tool["search"].calls, 2);
        assert_eq!(summary.per_tool["search"].errors, 1);
        assert_eq!(summary.per_tool["search"].avg_latency_ms, 200.0);
        assert_eq!(summary.recent_errors.len(), 1);
        assert_eq!(summary.recent_errors[0].tool_name, "search");
    }

    #[test]
    fn test_jsonl_log_appends_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlToolPerfLog::new(dir.path().join("perf").join("tools.jsonl"));
        for i in 0..5 {
            log.append(&record("echo", i % 2 == 0, i)).unwrap();
        }
        assert_eq!(log.recent(0).unwrap().len(), 5);
        let last_two = log.recent(2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].latency_ms, 4);
        assert_eq!(log.summary(0).unwrap().per_tool["echo"].errors, 2);
    }

    #[test]
    fn test_jsonl_log_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.jsonl");
        let log = JsonlToolPerfLog::new(&path);
        log.append(&record("echo", true, 1)).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{{not json"))
            .unwrap();
        log.append(&record("echo", true, 2)).unwrap();
        assert_eq!(log.recent(0).unwrap().len(), 2);
    }
}
