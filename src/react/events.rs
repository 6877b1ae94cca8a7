//! 轨迹事件：循环的每次状态转换在执行前先写一条 TraceEvent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件阶段标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Perceive,
    Decide,
    Execute,
    Evaluate,
    Continue,
    Replan,
    Conclude,
    Escalate,
    Resume,
    Fail,
    Ban,
    /// 数据质量问题（如置信度越界被截断）
    DataQuality,
    /// 低置信度时的评审建议
    Critique,
    ConfidenceDecline,
    /// 协作方错误（模型输出无法解析、模型调用失败）
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Perceive => "perceive",
            Stage::Decide => "decide",
            Stage::Execute => "execute",
            Stage::Evaluate => "evaluate",
            Stage::Continue => "continue",
            Stage::Replan => "replan",
            Stage::Conclude => "conclude",
            Stage::Escalate => "escalate",
            Stage::Resume => "resume",
            Stage::Fail => "fail",
            Stage::Ban => "ban",
            Stage::DataQuality => "data_quality",
            Stage::Critique => "critique",
            Stage::ConfidenceDecline => "confidence_decline",
            Stage::Error => "error",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// {timestamp, session_id, stage, payload}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub stage: Stage,
    pub payload: Value,
}

impl TraceEvent {
    pub fn new(session_id: impl Into<String>, stage: Stage, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            stage,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_labels_match_serde() {
        for stage in [Stage::DataQuality, Stage::ConfidenceDecline, Stage::Perceive] {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, Value::String(stage.as_str().to_string()));
        }
    }
}
