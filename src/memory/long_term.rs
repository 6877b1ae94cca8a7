//! 长期记忆：跨会话检索
//!
//! 感知前 search(query) 取得记忆摘录；会话到达终态时 append(session_record) 写入一次。
//! 多个会话共享同一个存储（读多写少）。检索按分词后的关键词重叠排序。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AgentError, SessionRecord};
use crate::memory::tokenizer::{overlap_score, tokenize_to_set};
use crate::tools::preview;

const ANSWER_PREVIEW_CHARS: usize = 200;

/// 一条长期记忆：某个已结束会话的问题与结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub session_id: String,
    pub query: String,
    pub status: String,
    pub outcome: String,
    pub recorded_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            query: record.query.clone(),
            status: record.final_status.as_str().to_string(),
            outcome: record
                .final_answer_or_escalation
                .as_ref()
                .map(|r| preview(&r.summary(), ANSWER_PREVIEW_CHARS))
                .unwrap_or_default(),
            recorded_at: Utc::now(),
        }
    }

    fn text(&self) -> String {
        format!("{} {}", self.query, self.outcome)
    }

    fn line(&self) -> String {
        format!("- [{}] {} -> {}", self.status, self.query, self.outcome)
    }
}

/// 按关键词重叠取前 k 条，拼成摘录文本
fn rank(entries: &[MemoryEntry], query: &str, k: usize) -> String {
    let query_tokens = tokenize_to_set(query);
    if query_tokens.is_empty() || k == 0 {
        return String::new();
    }
    let mut scored: Vec<(usize, &MemoryEntry)> = entries
        .iter()
        .map(|e| (overlap_score(&query_tokens, &tokenize_to_set(&e.text())), e))
        .filter(|(score, _)| *score > 0)
        .collect();
    // 同分时较新的在前
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.recorded_at.cmp(&a.1.recorded_at)));
    scored
        .into_iter()
        .take(k)
        .map(|(_, e)| e.line())
        .collect::<Vec<_>>()
        .join("\n")
}

/// 长期记忆接口
pub trait MemoryStore: Send + Sync {
    /// 检索与 query 相关的摘录；无结果时返回空串
    fn search(&self, query: &str) -> String;

    fn append(&self, record: &SessionRecord) -> Result<(), AgentError>;
}

/// 空实现：未启用长期记忆时使用
#[derive(Debug, Clone, Default)]
pub struct NoopMemory;

impl MemoryStore for NoopMemory {
    fn search(&self, _query: &str) -> String {
        String::new()
    }

    fn append(&self, _record: &SessionRecord) -> Result<(), AgentError> {
        Ok(())
    }
}

/// 进程内实现
#[derive(Debug)]
pub struct InMemoryStore {
    entries: RwLock<Vec<MemoryEntry>>,
    max_results: usize,
}

impl InMemoryStore {
    pub fn new(max_results: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_results,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(3)
    }
}

impl MemoryStore for InMemoryStore {
    fn search(&self, query: &str) -> String {
        match self.entries.read() {
            Ok(entries) => rank(&entries, query, self.max_results),
            Err(_) => String::new(),
        }
    }

    fn append(&self, record: &SessionRecord) -> Result<(), AgentError> {
        self.entries
            .write()
            .map_err(|e| AgentError::Storage(format!("memory lock poisoned: {e}")))?
            .push(MemoryEntry::from_record(record));
        Ok(())
    }
}

/// JSONL 文件实现：一行一条 MemoryEntry
#[derive(Debug)]
pub struct JsonlMemoryStore {
    path: PathBuf,
    max_results: usize,
    write_lock: Mutex<()>,
}

impl JsonlMemoryStore {
    pub fn new(path: impl AsRef<Path>, max_results: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_results,
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Vec<MemoryEntry> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => data
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl MemoryStore for JsonlMemoryStore {
    fn search(&self, query: &str) -> String {
        rank(&self.load(), query, self.max_results)
    }

    fn append(&self, record: &SessionRecord) -> Result<(), AgentError> {
        let line = serde_json::to_string(&MemoryEntry::from_record(record))?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| AgentError::Storage(format!("memory lock poisoned: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Resolution, SessionStatus};

    fn record(id: &str, query: &str, answer: &str) -> SessionRecord {
        let mut record = SessionRecord::empty(id, query);
        record.final_status = SessionStatus::Concluded;
        record.final_answer_or_escalation = Some(Resolution::Answer {
            text: answer.to_string(),
        });
        record
    }

    #[test]
    fn test_in_memory_search_ranks_by_overlap() {
        let store = InMemoryStore::new(2);
        store.append(&record("a", "weather in Paris", "sunny")).unwrap();
        store.append(&record("b", "capital of France", "Paris")).unwrap();
        store.append(&record("c", "rust borrow checker", "lifetimes")).unwrap();

        let excerpt = store.search("what is the capital of France");
        let first = excerpt.lines().next().unwrap();
        assert!(first.contains("capital of France"));
        assert!(!excerpt.contains("borrow"));
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let store = InMemoryStore::default();
        store.append(&record("a", "anything", "x")).unwrap();
        assert_eq!(store.search("  "), "");
        assert_eq!(NoopMemory.search("anything"), "");
    }

    #[test]
    fn test_jsonl_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.jsonl");
        JsonlMemoryStore::new(&path, 3)
            .append(&record("a", "法国的首都", "巴黎"))
            .unwrap();

        let reopened = JsonlMemoryStore::new(&path, 3);
        assert!(reopened.search("首都是哪里").contains("巴黎"));
    }
}
