//! 会话数据模型
//!
//! Plan 一旦创建不可变，replan 时追加新版本而不是修改旧版本；Step 评估完成后不再修改。
//! SessionRecord 是终态写盘（以及挂起检查点）的完整形状。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Budget, SessionStatus};
use crate::memory::FailureNote;
use crate::react::{LoopPolicy, ParseOutcome, PerceptionSnapshot, PlanDraft, Stage, StepOutcome};
use crate::tools::{CallRecord, CodeUnit, ExecutionResult, SandboxRun, ToolStats};

/// Plan 的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// 首次规划（或恢复后的首次规划）
    Initial,
    /// 沿用上一版子目标，为下一个子目标生成代码
    Continuation,
    /// 上一步被判定离题或失败后重新规划
    Replan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// 从 1 开始
    pub version: u32,
    pub kind: PlanKind,
    pub sub_goals: Vec<String>,
    /// 本版代码负责的子目标下标
    pub cursor: usize,
    pub code: CodeUnit,
    /// 派生自哪个版本（continuation / replan）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn remaining_sub_goals(&self) -> usize {
        self.sub_goals.len().saturating_sub(self.cursor + 1)
    }

    pub fn current_sub_goal(&self) -> Option<&str> {
        self.sub_goals.get(self.cursor).map(String::as_str)
    }
}

/// 只追加的 Plan 版本序列
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanHistory {
    plans: Vec<Arc<Plan>>,
}

impl PlanHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_version(&self) -> u32 {
        self.plans.len() as u32 + 1
    }

    pub fn push(&mut self, plan: Plan) -> Arc<Plan> {
        let plan = Arc::new(plan);
        self.plans.push(plan.clone());
        plan
    }

    pub fn latest(&self) -> Option<&Arc<Plan>> {
        self.plans.last()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Plan>> {
        self.plans.iter()
    }

    /// 可读的版本列表：每个版本的子目标，当前子目标以 `>` 标记，附带来源版本
    pub fn render(&self) -> String {
        let mut lines = vec!["Plan History:".to_string()];
        for plan in &self.plans {
            let origin = match (plan.kind, plan.parent) {
                (PlanKind::Replan, Some(p)) => format!(" (replan from v{p})"),
                (PlanKind::Continuation, Some(p)) => format!(" (continues v{p})"),
                _ => String::new(),
            };
            lines.push(format!("v{}{}:", plan.version, origin));
            for (i, goal) in plan.sub_goals.iter().enumerate() {
                let marker = if i == plan.cursor { ">" } else { "-" };
                lines.push(format!("  {marker} {}. {goal}", i + 1));
            }
        }
        lines.join("\n")
    }
}

/// 一次循环迭代
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 从 1 开始，会话内严格递增
    pub index: usize,
    pub plan: Arc<Plan>,
    pub snapshot: Arc<PerceptionSnapshot>,
    pub execution: ExecutionResult,
    #[serde(default)]
    pub calls: Vec<CallRecord>,
    pub outcome: StepOutcome,
    /// 截断到 [0,1] 后的置信度
    pub confidence: f64,
    /// 与上一步置信度之差
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_delta: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExhausted { budget: Budget, limit: usize },
    Cancelled,
    /// 协作方或存储的不可恢复错误
    Unrecoverable { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::BudgetExhausted { .. } => write!(f, "budget exhausted"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Unrecoverable { message } => write!(f, "{message}"),
        }
    }
}

/// 评审建议（低置信度时生成）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub confidence: f64,
    pub issues: Vec<String>,
    pub advice: String,
}

/// 升级到人工时发给调用方的结构化请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub session_id: String,
    pub resume_token: String,
    pub question: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<Critique>,
    pub last_output: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// 最终答案、升级请求或失败原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    Answer { text: String },
    Escalation { request: EscalationRequest },
    Failure { reason: FailureReason },
}

impl Resolution {
    pub fn summary(&self) -> String {
        match self {
            Resolution::Answer { text } => text.clone(),
            Resolution::Escalation { request } => format!("escalated: {}", request.question),
            Resolution::Failure { reason } => format!("failed: {reason}"),
        }
    }
}

/// 协作方调用失败（模型调用重试后仍失败等）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorError {
    pub message: String,
    /// true 表示按 fail 结果处理（消耗一次重试），false 表示直接终止
    pub recoverable: bool,
}

/// 协作方的一次响应（按发生顺序记录，供 dry-run 回放）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collaborator", rename_all = "snake_case")]
pub enum Exchange {
    Perception {
        response: Result<ParseOutcome<PerceptionSnapshot>, CollaboratorError>,
    },
    Decision {
        response: Result<ParseOutcome<PlanDraft>, CollaboratorError>,
    },
    Sandbox { run: SandboxRun },
}

/// 会话记录：终态写入一次；挂起时作为检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub query: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub plans: PlanHistory,
    pub final_status: SessionStatus,
    pub final_answer_or_escalation: Option<Resolution>,
    pub step_count: usize,
    pub retry_count: usize,
    #[serde(default)]
    pub tool_stats: BTreeMap<String, ToolStats>,
    #[serde(default)]
    pub failure_memory: Vec<FailureNote>,
    #[serde(default)]
    pub human_inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_confidence: Option<f64>,
    pub policy: LoopPolicy,
    #[serde(default)]
    pub transcript: Vec<Exchange>,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl SessionRecord {
    /// 尚未运行的空记录
    pub fn empty(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            closed_at: None,
            query: query.into(),
            steps: Vec::new(),
            plans: PlanHistory::new(),
            final_status: SessionStatus::Running,
            final_answer_or_escalation: None,
            step_count: 0,
            retry_count: 0,
            tool_stats: BTreeMap::new(),
            failure_memory: Vec::new(),
            human_inputs: Vec::new(),
            resume_token: None,
            last_output: None,
            last_confidence: None,
            policy: LoopPolicy::default(),
            transcript: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn final_answer(&self) -> Option<&str> {
        match &self.final_answer_or_escalation {
            Some(Resolution::Answer { text }) => Some(text),
            _ => None,
        }
    }

    /// 本会话全部工具调用
    pub fn calls(&self) -> impl Iterator<Item = &CallRecord> {
        self.steps.iter().flat_map(|s| s.calls.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Op;

    fn plan(version: u32, kind: PlanKind, parent: Option<u32>, goals: &[&str], cursor: usize) -> Plan {
        Plan {
            version,
            kind,
            sub_goals: goals.iter().map(|s| s.to_string()).collect(),
            cursor,
            code: CodeUnit {
                ops: vec![Op::Return { value: "x".into() }],
            },
            parent,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_remaining_sub_goals() {
        let p = plan(1, PlanKind::Initial, None, &["search", "summarize", "answer"], 0);
        assert_eq!(p.remaining_sub_goals(), 2);
        assert_eq!(p.current_sub_goal(), Some("search"));
        let last = plan(2, PlanKind::Continuation, Some(1), &["search", "summarize", "answer"], 2);
        assert_eq!(last.remaining_sub_goals(), 0);
        let empty = plan(3, PlanKind::Initial, None, &[], 0);
        assert_eq!(empty.remaining_sub_goals(), 0);
    }

    #[test]
    fn test_history_is_append_only_and_renders_parentage() {
        let mut history = PlanHistory::new();
        let first = history.push(plan(history.next_version(), PlanKind::Initial, None, &["look up"], 0));
        history.push(plan(history.next_version(), PlanKind::Replan, Some(1), &["search again", "answer"], 0));
        assert_eq!(history.len(), 2);
        assert_eq!(first.version, 1);
        assert_eq!(history.latest().map(|p| p.version), Some(2));

        let text = history.render();
        assert!(text.starts_with("Plan History:"));
        assert!(text.contains("v2 (replan from v1):"));
        assert!(text.contains("  > 1. search again"));
        assert!(text.contains("  - 2. answer"));
    }

    #[test]
    fn test_failure_reason_labels() {
        let budget = FailureReason::BudgetExhausted {
            budget: Budget::Steps,
            limit: 3,
        };
        assert_eq!(budget.to_string(), "budget exhausted");
        assert_eq!(FailureReason::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_record_roundtrips_through_json() {
        let mut record = SessionRecord::empty("s-1", "capital of France");
        record.final_status = SessionStatus::Concluded;
        record.final_answer_or_escalation = Some(Resolution::Answer { text: "Paris".into() });
        record.stages = vec![Stage::Start, Stage::Conclude];
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"final_answer_or_escalation\""));
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.final_answer(), Some("Paris"));
        assert_eq!(back, record);
    }
}
