//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：prompt 进，文本出。
//! 调用失败为可恢复错误，由调用方组件（感知 / 决策）最多重试一次。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Empty response")]
    EmptyResponse,

    #[error("Script exhausted")]
    Exhausted,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 调用一次模型，失败时再重试一次；第二次失败向上返回
pub async fn complete_with_retry(
    llm: &dyn LlmClient,
    messages: &[Message],
) -> Result<String, LlmError> {
    match llm.complete(messages).await {
        Ok(text) => Ok(text),
        Err(first) => {
            tracing::warn!(error = %first, "LLM call failed, retrying once");
            llm.complete(messages).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_retry_once_recovers() {
        let llm = ScriptedLlmClient::new(vec![Err(LlmError::Timeout), Ok("ok".to_string())]);
        let out = complete_with_retry(&llm, &[Message::user("hi")]).await;
        assert_eq!(out, Ok("ok".to_string()));
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_second_failure() {
        let llm = ScriptedLlmClient::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::Api("503".into())),
            Ok("never reached".to_string()),
        ]);
        let out = complete_with_retry(&llm, &[Message::user("hi")]).await;
        assert_eq!(out, Err(LlmError::Api("503".into())));
        assert_eq!(llm.calls(), 2);
    }
}
