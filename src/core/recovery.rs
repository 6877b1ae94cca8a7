//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供主循环决定是纠正重试、消耗一次重试还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::Perception(diagnostic) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous perception output could not be parsed: {diagnostic}. \
                 Reply with exactly one ```json fenced object containing the fields \
                 entities, facts, result_requirement, confidence (a number between 0 and 1), \
                 local_goal_achieved, original_goal_achieved, reasoning and solution_summary."
            )),
            AgentError::Decision(diagnostic) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous plan could not be parsed: {diagnostic}. \
                 Reply with exactly one ```json fenced object of the form \
                 {{\"plan\": [\"sub-goal\", ...], \"code\": {{\"ops\": [...]}}}} \
                 and only use tools from the catalogue."
            )),
            AgentError::Sandbox(_) | AgentError::Llm(_) => RecoveryAction::ConsumeRetry,
            AgentError::BudgetExhausted { .. } | AgentError::Cancelled => RecoveryAction::Abort,
            _ => RecoveryAction::Abort,
        }
    }
}
