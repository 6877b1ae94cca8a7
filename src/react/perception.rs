//! 感知：把当前上下文转为结构化快照
//!
//! 输入为查询、上一步输出、记忆摘录、工具性能汇总；输出 PerceptionSnapshot（实体、事实、置信度、局部目标是否达成）。
//! 模型回复先做字段补全与类型宽松转换（"yes" / "1" 视为 true，数字字符串视为置信度），仍无法解析时为 Malformed。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::llm::{complete_with_retry, LlmClient, Message};
use crate::memory::ToolPerformanceSummary;
use crate::react::parse::{extract_json_block, ParseOutcome};

/// system prompt 中的阶段标记
pub const PERCEPTION_TAG: &str = "[hive:perception]";

const DEFAULT_PERCEPTION_PROMPT: &str = "You are the perception module of a tool-using agent. \
Read the JSON context and describe what is known so far. Reply with one ```json fenced object with the fields: \
entities (list of strings), facts (list of strings), result_requirement (what a complete answer must contain), \
confidence (number between 0 and 1), local_goal_achieved (bool, the current sub-goal is satisfied), \
original_goal_achieved (bool), reasoning, solution_summary.";

/// 快照来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    UserQuery,
    StepResult,
    HumanInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionInput {
    pub session_id: String,
    pub query: String,
    pub kind: SnapshotKind,
    pub last_output: Option<String>,
    pub memory_excerpt: String,
    pub tool_summary: ToolPerformanceSummary,
    pub banned_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionSnapshot {
    pub entities: Vec<String>,
    pub facts: Vec<String>,
    pub result_requirement: String,
    /// 原始值，未截断；评估时截断到 [0,1]
    pub confidence: f64,
    pub local_goal_achieved: bool,
    pub original_goal_achieved: bool,
    pub reasoning: String,
    pub solution_summary: String,
    /// 生成该快照时使用的记忆摘录
    #[serde(default)]
    pub memory_excerpt: String,
}

pub fn confidence_in_range(confidence: f64) -> bool {
    (0.0..=1.0).contains(&confidence)
}

fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => true,
            "false" | "no" | "n" | "0" => false,
            _ => default,
        },
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        _ => default,
    }
}

fn coerce_f64(value: Option<&Value>, default: f64) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn coerce_string(value: Option<&Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => default.to_string(),
        Some(other) => other.to_string(),
    }
}

fn coerce_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn snapshot_from_object(obj: &Map<String, Value>, memory_excerpt: &str) -> PerceptionSnapshot {
    PerceptionSnapshot {
        entities: coerce_list(obj.get("entities")),
        facts: coerce_list(obj.get("facts")),
        result_requirement: coerce_string(obj.get("result_requirement"), "No requirement specified."),
        confidence: coerce_f64(obj.get("confidence"), 0.0),
        local_goal_achieved: coerce_bool(obj.get("local_goal_achieved"), false),
        original_goal_achieved: coerce_bool(obj.get("original_goal_achieved"), false),
        reasoning: coerce_string(obj.get("reasoning"), "No reasoning given."),
        solution_summary: coerce_string(obj.get("solution_summary"), "No summary."),
        memory_excerpt: memory_excerpt.to_string(),
    }
}

/// 解析模型回复为快照
pub fn parse_snapshot(reply: &str, memory_excerpt: &str) -> ParseOutcome<PerceptionSnapshot> {
    let Some(block) = extract_json_block(reply) else {
        return ParseOutcome::malformed(reply, "no JSON object found in perception reply");
    };
    match serde_json::from_str::<Value>(block) {
        Ok(Value::Object(obj)) => ParseOutcome::Parsed(snapshot_from_object(&obj, memory_excerpt)),
        Ok(other) => ParseOutcome::malformed(reply, format!("expected a JSON object, got {other}")),
        Err(e) => ParseOutcome::malformed(reply, format!("invalid JSON: {e}")),
    }
}

#[async_trait]
pub trait Perceiver: Send + Sync {
    /// correction 为上一次回复无法解析时的纠正提示
    async fn perceive(
        &self,
        input: &PerceptionInput,
        correction: Option<&str>,
    ) -> Result<ParseOutcome<PerceptionSnapshot>, AgentError>;
}

/// 基于 LLM 的感知
pub struct LlmPerception {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPerception {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_PERCEPTION_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn messages(&self, input: &PerceptionInput, correction: Option<&str>) -> Result<Vec<Message>, AgentError> {
        let context = serde_json::to_string_pretty(input)?;
        let mut user = String::new();
        if let Some(c) = correction {
            user.push_str(c);
            user.push_str("\n\n");
        }
        user.push_str(&format!("```json\n{context}\n```"));
        Ok(vec![
            Message::system(format!("{PERCEPTION_TAG}\n{}", self.system_prompt)),
            Message::user(user),
        ])
    }
}

#[async_trait]
impl Perceiver for LlmPerception {
    async fn perceive(
        &self,
        input: &PerceptionInput,
        correction: Option<&str>,
    ) -> Result<ParseOutcome<PerceptionSnapshot>, AgentError> {
        let messages = self.messages(input, correction)?;
        let reply = complete_with_retry(self.llm.as_ref(), &messages).await?;
        tracing::debug!(session = %input.session_id, reply_len = reply.len(), "Perception reply");
        Ok(parse_snapshot(&reply, &input.memory_excerpt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient, ScriptedLlmClient};

    fn input(last_output: Option<&str>) -> PerceptionInput {
        PerceptionInput {
            session_id: "s-1".into(),
            query: "find the capital of France".into(),
            kind: SnapshotKind::UserQuery,
            last_output: last_output.map(str::to_string),
            memory_excerpt: "- [concluded] capital of Spain -> Madrid".into(),
            tool_summary: ToolPerformanceSummary::default(),
            banned_tools: vec![],
            current_plan: None,
            human_input: None,
            previous_confidence: None,
        }
    }

    #[test]
    fn test_coerces_loose_fields() {
        let reply = r#"```json
{"entities": ["France", 1], "confidence": "0.75", "local_goal_achieved": "yes", "original_goal_achieved": 0}
```"#;
        match parse_snapshot(reply, "mem") {
            ParseOutcome::Parsed(s) => {
                assert_eq!(s.entities, vec!["France".to_string(), "1".to_string()]);
                assert_eq!(s.confidence, 0.75);
                assert!(s.local_goal_achieved);
                assert!(!s.original_goal_achieved);
                assert_eq!(s.result_requirement, "No requirement specified.");
                assert_eq!(s.memory_excerpt, "mem");
            }
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_confidence_defaults_to_zero() {
        match parse_snapshot(r#"{"confidence": "very high"}"#, "") {
            ParseOutcome::Parsed(s) => assert_eq!(s.confidence, 0.0),
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert!(!parse_snapshot("I think it's Paris", "").is_parsed());
        assert!(!parse_snapshot("{\"confidence\": }", "").is_parsed());
    }

    #[test]
    fn test_confidence_in_range() {
        assert!(confidence_in_range(0.0));
        assert!(confidence_in_range(1.0));
        assert!(!confidence_in_range(1.2));
        assert!(!confidence_in_range(f64::NAN));
    }

    #[tokio::test]
    async fn test_mock_perception_flow() {
        let perception = LlmPerception::new(Arc::new(MockLlmClient));
        match perception.perceive(&input(None), None).await.unwrap() {
            ParseOutcome::Parsed(s) => {
                assert!(!s.local_goal_achieved);
                assert_eq!(s.confidence, 0.6);
            }
            other => panic!("expected parsed, got {other:?}"),
        }
        match perception.perceive(&input(Some("Paris")), None).await.unwrap() {
            ParseOutcome::Parsed(s) => assert!(s.local_goal_achieved),
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_correction_is_sent_with_context() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok("{\"confidence\": 0.5}".into())]));
        let perception = LlmPerception::new(llm.clone());
        perception
            .perceive(&input(None), Some("Fix your JSON"))
            .await
            .unwrap();
        let prompts = llm.prompts();
        let user = &prompts[0][1].content;
        assert!(user.starts_with("Fix your JSON"));
        assert!(user.contains("```json"));
        assert!(prompts[0][0].content.contains(PERCEPTION_TAG));
    }

    #[tokio::test]
    async fn test_model_failure_is_retried_once_then_propagated() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::Timeout),
        ]));
        let perception = LlmPerception::new(llm.clone());
        let err = perception.perceive(&input(None), None).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        assert_eq!(llm.calls(), 2);
    }
}
