//! Mock LLM 客户端（无需 API）
//!
//! - MockLlmClient：离线演示用。感知阶段无上一步输出时给出 0.6 置信度，有输出则判定目标达成；
//!   决策阶段先用 echo 工具回显查询，下一步直接 return 上一步输出，便于本地跑通主循环。
//! - ScriptedLlmClient：测试用，按顺序返回预设回复。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{LlmClient, LlmError, Message, Role};
use crate::react::decision::DECISION_TAG;
use crate::react::parse::extract_json_block;
use crate::react::perception::PERCEPTION_TAG;

/// Mock 客户端：根据 system prompt 中的阶段标记给出固定形状的回复
#[derive(Debug, Default)]
pub struct MockLlmClient;

fn fenced(value: Value) -> String {
    format!("```json\n{value}\n```")
}

fn non_empty_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

fn perception_reply(input: &Value) -> String {
    match non_empty_str(input, "last_output") {
        Some(output) => fenced(json!({
            "entities": [],
            "facts": [output],
            "result_requirement": "Answer the query",
            "confidence": 0.9,
            "local_goal_achieved": true,
            "original_goal_achieved": true,
            "reasoning": "The previous step produced an answer.",
            "solution_summary": output,
        })),
        None => fenced(json!({
            "entities": [],
            "facts": [],
            "result_requirement": "Answer the query",
            "confidence": 0.6,
            "local_goal_achieved": false,
            "original_goal_achieved": false,
            "reasoning": "Nothing has been executed yet.",
            "solution_summary": "Not ready yet",
        })),
    }
}

fn decision_reply(input: &Value) -> String {
    let achieved = input
        .pointer("/snapshot/local_goal_achieved")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    match (achieved, non_empty_str(input, "last_output")) {
        (true, Some(output)) => fenced(json!({
            "plan": ["Report the answer"],
            "code": { "ops": [ { "op": "return", "value": output } ] },
        })),
        _ => {
            let query = non_empty_str(input, "query").unwrap_or("(empty)");
            fenced(json!({
                "plan": ["Echo the query back"],
                "code": { "ops": [ { "op": "call", "tool": "echo", "args": { "text": query } } ] },
            }))
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let input: Value = extract_json_block(last_user)
            .and_then(|block| serde_json::from_str(block).ok())
            .unwrap_or(Value::Null);

        if system.contains(PERCEPTION_TAG) {
            Ok(perception_reply(&input))
        } else if system.contains(DECISION_TAG) {
            Ok(decision_reply(&input))
        } else {
            Ok(format!("Echo from Mock: {last_user}"))
        }
    }
}

/// 脚本客户端：依次弹出预设结果，耗尽后返回 LlmError::Exhausted
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息列表
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        let mut replies = self
            .replies
            .lock()
            .map_err(|e| LlmError::Api(format!("script lock poisoned: {e}")))?;
        replies.pop_front().unwrap_or(Err(LlmError::Exhausted))
    }
}
