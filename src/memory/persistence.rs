//! 会话记录持久化
//!
//! - 终态记录 `sessions/<id>.json`：结束或失败时写入一次（create_new），之后不可改写。
//! - 挂起检查点 `sessions/suspended/<id>.json`：升级到人工时写入，恢复后删除。

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::core::{AgentError, SessionRecord};

pub trait SessionStore: Send + Sync {
    /// 写入终态记录；同一会话重复写入返回错误
    fn write_final(&self, record: &SessionRecord) -> Result<(), AgentError>;

    fn load_final(&self, session_id: &str) -> Result<SessionRecord, AgentError>;

    /// 全部终态记录（按 session_id 排序）
    fn list_final(&self) -> Result<Vec<SessionRecord>, AgentError>;

    /// 写入（覆盖）挂起检查点
    fn suspend(&self, record: &SessionRecord) -> Result<(), AgentError>;

    fn load_suspended(&self, session_id: &str) -> Result<SessionRecord, AgentError>;

    /// 全部挂起检查点（按 session_id 排序）
    fn list_suspended(&self) -> Result<Vec<SessionRecord>, AgentError>;

    fn clear_suspended(&self, session_id: &str) -> Result<(), AgentError>;
}

/// 文件实现
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn final_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn suspended_path(&self, session_id: &str) -> PathBuf {
        self.dir.join("suspended").join(format!("{session_id}.json"))
    }

    fn read(path: &Path, session_id: &str) -> Result<SessionRecord, AgentError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AgentError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    /// 目录下全部 `*.json` 记录；无法解析的文件跳过
    fn read_all(dir: &Path) -> Result<Vec<SessionRecord>, AgentError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(AgentError::from)
                .and_then(|data| serde_json::from_str::<SessionRecord>(&data).map_err(AgentError::from))
            {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record"),
            }
        }
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(records)
    }
}

impl SessionStore for FileSessionStore {
    fn write_final(&self, record: &SessionRecord) -> Result<(), AgentError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.final_path(&record.session_id);
        let body = serde_json::to_string_pretty(record)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => AgentError::Storage(format!(
                    "session record {} already written",
                    record.session_id
                )),
                _ => e.into(),
            })?;
        file.write_all(body.as_bytes())?;
        Ok(())
    }

    fn load_final(&self, session_id: &str) -> Result<SessionRecord, AgentError> {
        Self::read(&self.final_path(session_id), session_id)
    }

    fn list_final(&self) -> Result<Vec<SessionRecord>, AgentError> {
        Self::read_all(&self.dir)
    }

    fn suspend(&self, record: &SessionRecord) -> Result<(), AgentError> {
        let path = self.suspended_path(&record.session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    fn load_suspended(&self, session_id: &str) -> Result<SessionRecord, AgentError> {
        Self::read(&self.suspended_path(session_id), session_id)
    }

    fn list_suspended(&self) -> Result<Vec<SessionRecord>, AgentError> {
        Self::read_all(&self.dir.join("suspended"))
    }

    fn clear_suspended(&self, session_id: &str) -> Result<(), AgentError> {
        match std::fs::remove_file(self.suspended_path(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 内存实现（测试、dry-run 回放）
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    finals: RwLock<BTreeMap<String, SessionRecord>>,
    suspended: RwLock<BTreeMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> AgentError {
    AgentError::Storage(format!("session store lock poisoned: {e}"))
}

impl SessionStore for InMemorySessionStore {
    fn write_final(&self, record: &SessionRecord) -> Result<(), AgentError> {
        let mut finals = self.finals.write().map_err(poisoned)?;
        if finals.contains_key(&record.session_id) {
            return Err(AgentError::Storage(format!(
                "session record {} already written",
                record.session_id
            )));
        }
        finals.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn load_final(&self, session_id: &str) -> Result<SessionRecord, AgentError> {
        self.finals
            .read()
            .map_err(poisoned)?
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    fn list_final(&self) -> Result<Vec<SessionRecord>, AgentError> {
        Ok(self.finals.read().map_err(poisoned)?.values().cloned().collect())
    }

    fn suspend(&self, record: &SessionRecord) -> Result<(), AgentError> {
        self.suspended
            .write()
            .map_err(poisoned)?
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn load_suspended(&self, session_id: &str) -> Result<SessionRecord, AgentError> {
        self.suspended
            .read()
            .map_err(poisoned)?
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    fn list_suspended(&self) -> Result<Vec<SessionRecord>, AgentError> {
        Ok(self.suspended.read().map_err(poisoned)?.values().cloned().collect())
    }

    fn clear_suspended(&self, session_id: &str) -> Result<(), AgentError> {
        self.suspended.write().map_err(poisoned)?.remove(session_id);
        Ok(())
    }
}
