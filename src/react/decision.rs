//! 决策：根据感知快照与可用工具目录生成计划（有序子目标）和下一段待执行的代码单元
//!
//! 模型回复形如 `{"plan": ["..."], "code": {"ops": [...]}}`；code 也可以是包含该 JSON 的字符串。
//! 引用了目录外工具、或没有任何操作的代码单元视为 Malformed。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, PlanKind};
use crate::llm::{complete_with_retry, LlmClient, Message};
use crate::memory::ToolPerformanceSummary;
use crate::react::parse::{extract_json_block, ParseOutcome};
use crate::react::PerceptionSnapshot;
use crate::tools::{code_unit_schema_json, CodeUnit, ToolSpec};

/// system prompt 中的阶段标记
pub const DECISION_TAG: &str = "[hive:decision]";

const DEFAULT_DECISION_PROMPT: &str = "You are the decision module of a tool-using agent. \
Given the perception snapshot and the tool catalogue, produce an ordered list of sub-goals and ONE code unit \
that makes progress on the current sub-goal. Only call tools listed in the catalogue. \
Reply with one ```json fenced object: {\"plan\": [\"sub-goal\", ...], \"code\": <code unit>}.";

/// 决策结果：子目标 + 代码单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    #[serde(rename = "plan", alias = "sub_goals", default)]
    pub sub_goals: Vec<String>,
    pub code: CodeUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub query: String,
    pub kind: PlanKind,
    pub strategy: String,
    pub snapshot: PerceptionSnapshot,
    pub catalogue: Vec<ToolSpec>,
    pub last_output: Option<String>,
    pub tool_summary: ToolPerformanceSummary,
    /// continuation 时为当前计划的子目标
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub current_plan: Vec<String>,
    /// continuation 时要处理的子目标
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sub_goal: Option<String>,
}

/// 校验代码单元只引用目录中的工具
fn validate(draft: &PlanDraft, catalogue: &[ToolSpec]) -> Result<(), String> {
    if draft.code.ops.is_empty() {
        return Err("code unit has no operations".to_string());
    }
    let unknown: Vec<&str> = draft
        .code
        .tools_referenced()
        .into_iter()
        .filter(|tool| !catalogue.iter().any(|spec| spec.name == *tool))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(format!("code references tools outside the catalogue: {}", unknown.join(", ")))
    }
}

/// 解析模型回复
pub fn parse_plan(reply: &str, catalogue: &[ToolSpec]) -> ParseOutcome<PlanDraft> {
    let Some(block) = extract_json_block(reply) else {
        return ParseOutcome::malformed(reply, "no JSON object found in decision reply");
    };
    let mut value: Value = match serde_json::from_str(block) {
        Ok(v) => v,
        Err(e) => return ParseOutcome::malformed(reply, format!("invalid JSON: {e}")),
    };
    // code 以字符串形式给出时再解析一层
    let inner_code = match value.get("code") {
        Some(Value::String(text)) => {
            match extract_json_block(text).map(|s| serde_json::from_str::<Value>(s)) {
                Some(Ok(inner)) => Some(inner),
                _ => return ParseOutcome::malformed(reply, "code is a string without a JSON code unit"),
            }
        }
        _ => None,
    };
    if let Some(inner) = inner_code {
        value["code"] = inner;
    }
    let draft: PlanDraft = match serde_json::from_value(value) {
        Ok(d) => d,
        Err(e) => return ParseOutcome::malformed(reply, format!("invalid plan shape: {e}")),
    };
    match validate(&draft, catalogue) {
        Ok(()) => ParseOutcome::Parsed(draft),
        Err(diagnostic) => ParseOutcome::malformed(reply, diagnostic),
    }
}

#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(
        &self,
        input: &DecisionInput,
        correction: Option<&str>,
    ) -> Result<ParseOutcome<PlanDraft>, AgentError>;
}

/// 基于 LLM 的决策
pub struct LlmDecision {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmDecision {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_DECISION_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn system(&self) -> String {
        format!(
            "{DECISION_TAG}\n{}\n\n## Code unit JSON Schema\n{}",
            self.system_prompt,
            code_unit_schema_json()
        )
    }
}

#[async_trait]
impl Decider for LlmDecision {
    async fn decide(
        &self,
        input: &DecisionInput,
        correction: Option<&str>,
    ) -> Result<ParseOutcome<PlanDraft>, AgentError> {
        let context = serde_json::to_string_pretty(input)?;
        let mut user = String::new();
        if let Some(c) = correction {
            user.push_str(c);
            user.push_str("\n\n");
        }
        user.push_str(&format!("```json\n{context}\n```"));
        let messages = vec![Message::system(self.system()), Message::user(user)];
        let reply = complete_with_retry(self.llm.as_ref(), &messages).await?;
        tracing::debug!(kind = ?input.kind, reply_len = reply.len(), "Decision reply");
        Ok(parse_plan(&reply, &input.catalogue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::Op;
    use serde_json::json;

    fn catalogue() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "echo".into(),
            input_schema: json!({"type": "object"}),
            description: "echo".into(),
        }]
    }

    fn snapshot(achieved: bool) -> PerceptionSnapshot {
        PerceptionSnapshot {
            entities: vec![],
            facts: vec![],
            result_requirement: "capital".into(),
            confidence: 0.8,
            local_goal_achieved: achieved,
            original_goal_achieved: false,
            reasoning: String::new(),
            solution_summary: String::new(),
            memory_excerpt: String::new(),
        }
    }

    #[test]
    fn test_parse_plan_with_string_code() {
        let reply = r#"{"plan": ["look it up"], "code": "{\"ops\": [{\"op\": \"return\", \"value\": \"Paris\"}]}"}"#;
        match parse_plan(reply, &catalogue()) {
            ParseOutcome::Parsed(draft) => {
                assert_eq!(draft.sub_goals, vec!["look it up".to_string()]);
                assert_eq!(draft.code.ops, vec![Op::Return { value: "Paris".into() }]);
            }
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tool_is_malformed() {
        let reply = r#"{"plan": ["x"], "code": {"ops": [{"op": "call", "tool": "shell", "args": {}}]}}"#;
        match parse_plan(reply, &catalogue()) {
            ParseOutcome::Malformed { diagnostic, .. } => assert!(diagnostic.contains("shell")),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_code_is_malformed() {
        assert!(!parse_plan(r#"{"plan": [], "code": {"ops": []}}"#, &catalogue()).is_parsed());
        assert!(!parse_plan("no plan today", &catalogue()).is_parsed());
    }

    #[tokio::test]
    async fn test_mock_decision_returns_output_once_achieved() {
        let decision = LlmDecision::new(Arc::new(MockLlmClient));
        let mut input = DecisionInput {
            query: "capital of France".into(),
            kind: PlanKind::Initial,
            strategy: "exploratory".into(),
            snapshot: snapshot(false),
            catalogue: catalogue(),
            last_output: None,
            tool_summary: ToolPerformanceSummary::default(),
            current_plan: vec![],
            next_sub_goal: None,
        };
        match decision.decide(&input, None).await.unwrap() {
            ParseOutcome::Parsed(draft) => assert_eq!(draft.code.tools_referenced(), vec!["echo"]),
            other => panic!("expected parsed, got {other:?}"),
        }

        input.snapshot = snapshot(true);
        input.last_output = Some("Paris".into());
        match decision.decide(&input, None).await.unwrap() {
            ParseOutcome::Parsed(draft) => {
                assert_eq!(draft.code.ops, vec![Op::Return { value: "Paris".into() }])
            }
            other => panic!("expected parsed, got {other:?}"),
        }
    }
}
