//! 会话监管：取消管理
//!
//! 每个会话持有一个子 CancellationToken；单个会话可以单独取消，Ctrl+C 时取消全部。

use std::collections::HashMap;
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    /// 根 token，取消后所有会话 token 一并取消
    root: CancellationToken,
    sessions: RwLock<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 为会话登记一个 token；已登记则返回原 token
    pub fn register(&self, session_id: &str) -> CancellationToken {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 取消单个会话；未登记时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        let sessions = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match sessions.get(session_id) {
            Some(token) => {
                tracing::info!(session = session_id, "Cancelling session");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ctrl+C
    pub fn cancel_all(&self) {
        tracing::info!("Cancelling all sessions");
        self.root.cancel();
    }

    /// cancel_all 之后为 true
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// 根 token，用于等待 cancel_all
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn remove(&self, session_id: &str) {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.remove(session_id);
    }

    pub fn active(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_single_session() {
        let supervisor = SessionSupervisor::new();
        let a = supervisor.register("a");
        let b = supervisor.register("b");
        assert!(supervisor.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!supervisor.cancel("missing"));
    }

    #[test]
    fn test_cancel_all_reaches_children() {
        let supervisor = SessionSupervisor::new();
        let a = supervisor.register("a");
        assert!(!supervisor.is_shutting_down());
        supervisor.cancel_all();
        assert!(a.is_cancelled());
        assert!(supervisor.is_shutting_down());
        // 取消后新登记的会话同样处于取消状态
        assert!(supervisor.register("late").is_cancelled());
        supervisor.remove("a");
        assert_eq!(supervisor.active(), 1);
    }
}
