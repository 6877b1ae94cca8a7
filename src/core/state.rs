//! 状态定义：主循环阶段（LoopState）与会话终态（SessionStatus）
//!
//! LoopState 描述单个会话内主循环所处阶段；SessionStatus 只允许向前推进：
//! running → escalated → concluded | failed，或 running → concluded | failed。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 主循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Init,
    Perceiving,
    Deciding,
    Executing,
    Evaluating,
    Replanning,
    Concluded,
    Escalated,
    Failed,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Concluded | LoopState::Escalated | LoopState::Failed)
    }
}

/// 会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// 等待人工输入（可恢复）；恢复后仍保持该状态直到终态
    Escalated,
    Concluded,
    Failed,
}

impl SessionStatus {
    fn rank(&self) -> u8 {
        match self {
            SessionStatus::Running => 0,
            SessionStatus::Escalated => 1,
            SessionStatus::Concluded | SessionStatus::Failed => 2,
        }
    }

    pub fn is_final(&self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Escalated => "escalated",
            SessionStatus::Concluded => "concluded",
            SessionStatus::Failed => "failed",
        }
    }

    /// 推进到下一状态；倒退或离开终态返回 InvalidTransition
    pub fn advance(&mut self, next: SessionStatus) -> Result<(), AgentError> {
        let allowed = if self.is_final() {
            false
        } else {
            next.rank() >= self.rank()
        };
        if !allowed {
            return Err(AgentError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward() {
        let mut status = SessionStatus::Running;
        status.advance(SessionStatus::Escalated).unwrap();
        status.advance(SessionStatus::Escalated).unwrap();
        status.advance(SessionStatus::Concluded).unwrap();
        assert_eq!(status, SessionStatus::Concluded);
    }

    #[test]
    fn test_status_never_moves_backward() {
        let mut status = SessionStatus::Escalated;
        assert!(status.advance(SessionStatus::Running).is_err());
        assert_eq!(status, SessionStatus::Escalated);
    }

    #[test]
    fn test_final_status_is_frozen() {
        let mut status = SessionStatus::Failed;
        assert!(status.advance(SessionStatus::Concluded).is_err());
        assert!(status.advance(SessionStatus::Failed).is_err());
        assert_eq!(status, SessionStatus::Failed);
    }

    #[test]
    fn test_terminal_loop_states() {
        assert!(LoopState::Concluded.is_terminal());
        assert!(LoopState::Escalated.is_terminal());
        assert!(!LoopState::Replanning.is_terminal());
    }
}
