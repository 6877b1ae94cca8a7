//! 轨迹存储（只追加）
//!
//! - JsonlTraceSink：一行一个 TraceEvent，持久化到文件，从不改写。
//! - Blackboard：进程内黑板，按游标增量读取，供 dry-run 回放与测试使用。
//!
//! 循环本身从不读回轨迹。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::AgentError;
use crate::react::{Stage, TraceEvent};

pub trait TraceSink: Send + Sync {
    fn append(&self, event: &TraceEvent) -> Result<(), AgentError>;
}

#[derive(Debug)]
pub struct JsonlTraceSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// 读取全部事件（离线分析用）
    pub fn read_all(&self) -> Result<Vec<TraceEvent>, AgentError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(data
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl TraceSink for JsonlTraceSink {
    fn append(&self, event: &TraceEvent) -> Result<(), AgentError> {
        let line = serde_json::to_string(event)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| AgentError::Storage(format!("trace lock poisoned: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// 进程内黑板
#[derive(Debug, Default, Clone)]
pub struct Blackboard {
    events: Arc<RwLock<Vec<TraceEvent>>>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// 读取游标之后的事件，返回 (事件, 新游标)
    pub fn since(&self, cursor: usize) -> (Vec<TraceEvent>, usize) {
        match self.events.read() {
            Ok(events) => {
                let start = cursor.min(events.len());
                (events[start..].to_vec(), events.len())
            }
            Err(_) => (Vec::new(), cursor),
        }
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events().into_iter().map(|e| e.stage).collect()
    }

    /// 某个会话的阶段序列
    pub fn stages_for(&self, session_id: &str) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.stage)
            .collect()
    }
}

impl TraceSink for Blackboard {
    fn append(&self, event: &TraceEvent) -> Result<(), AgentError> {
        self.events
            .write()
            .map_err(|e| AgentError::Storage(format!("blackboard lock poisoned: {e}")))?
            .push(event.clone());
        Ok(())
    }
}

/// 同时写入多个 sink（例如文件 + 黑板）
pub struct FanoutTraceSink {
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl FanoutTraceSink {
    pub fn new(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self { sinks }
    }
}

impl TraceSink for FanoutTraceSink {
    fn append(&self, event: &TraceEvent) -> Result<(), AgentError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.append(event) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(stage: Stage) -> TraceEvent {
        TraceEvent::new("s-1", stage, json!({}))
    }

    #[test]
    fn test_blackboard_cursor_reads() {
        let board = Blackboard::new();
        board.append(&event(Stage::Start)).unwrap();
        board.append(&event(Stage::Perceive)).unwrap();

        let (first, cursor) = board.since(0);
        assert_eq!(first.len(), 2);
        assert_eq!(cursor, 2);

        board.append(&event(Stage::Decide)).unwrap();
        let (rest, cursor) = board.since(cursor);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].stage, Stage::Decide);
        assert_eq!(cursor, 3);
        assert!(board.since(10).0.is_empty());
    }

    #[test]
    fn test_jsonl_sink_keeps_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlTraceSink::new(dir.path().join("trace").join("events.jsonl"));
        for stage in [Stage::Start, Stage::Perceive, Stage::Fail] {
            sink.append(&event(stage)).unwrap();
        }
        let stages: Vec<Stage> = sink.read_all().unwrap().into_iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Stage::Start, Stage::Perceive, Stage::Fail]);
    }

    #[test]
    fn test_fanout_writes_everywhere() {
        let a = Blackboard::new();
        let b = Blackboard::new();
        let fanout = FanoutTraceSink::new(vec![Arc::new(a.clone()), Arc::new(b.clone())]);
        fanout.append(&event(Stage::Start)).unwrap();
        assert_eq!(a.stages(), vec![Stage::Start]);
        assert_eq!(b.stages(), vec![Stage::Start]);
    }
}
