//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / ConsumeRetry / Abort。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 预算种类：步数或重试次数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Steps,
    Retries,
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Budget::Steps => write!(f, "steps"),
            Budget::Retries => write!(f, "retries"),
        }
    }
}

/// 沙箱执行失败（超时、调用次数超限、最后一个工具调用失败等）
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxError {
    #[error("Sandbox timed out after {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    #[error("Call budget of {budget} tool invocations exceeded")]
    CallBudgetExceeded { budget: usize },

    #[error("Tool {tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("Tool {tool} is not available in this step")]
    ToolUnavailable { tool: String },

    #[error("Code unit contains no operations")]
    EmptyCode,
}

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 感知阶段模型输出无法解析
    #[error("Perception error: {0}")]
    Perception(String),

    /// 决策阶段计划/代码无法解析
    #[error("Decision error: {0}")]
    Decision(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Budget exhausted: {budget} limit {limit} reached")]
    BudgetExhausted { budget: Budget, limit: usize },

    #[error("Cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Resume token does not match session {0}")]
    InvalidResumeToken(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Replay diverged: {0}")]
    Replay(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 带纠正提示重新调用一次（模型输出格式错误）
    RetryWithPrompt(String),
    /// 当作 fail 结果处理：消耗一次重试后回到感知
    ConsumeRetry,
    /// 终止会话
    Abort,
}
