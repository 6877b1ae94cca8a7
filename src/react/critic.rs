//! Critic：低置信度时的结果反思
//!
//! 规则式评审，不额外调用模型：根据快照与执行结果列出可疑之处并给出建议，
//! 写入 critique 轨迹事件并附在升级请求中，方便人工快速定位问题。

use crate::core::Critique;
use crate::react::PerceptionSnapshot;
use crate::tools::ExecutionResult;

const BASE_ADVICE: &str =
    "Low confidence detected. Recommend clarifying inputs, validating tool outputs, and tightening the plan steps.";

#[derive(Debug, Clone)]
pub struct Critic {
    threshold: f64,
}

impl Default for Critic {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl Critic {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// 置信度不低于阈值时返回 None
    pub fn critique(
        &self,
        confidence: f64,
        snapshot: &PerceptionSnapshot,
        result: Option<&ExecutionResult>,
    ) -> Option<Critique> {
        if confidence >= self.threshold {
            return None;
        }
        let mut issues = Vec::new();
        if snapshot.entities.is_empty() {
            issues.push("no entities were extracted from the context".to_string());
        }
        if snapshot.facts.is_empty() {
            issues.push("no supporting facts were found".to_string());
        }
        match result {
            Some(ExecutionResult::Error { error }) => issues.push(format!("execution failed: {error}")),
            Some(ExecutionResult::Success { partial_failures, .. }) if !partial_failures.is_empty() => {
                issues.push(format!("{} tool call(s) failed: {}", partial_failures.len(), partial_failures.join("; ")))
            }
            Some(ExecutionResult::Success { payload, .. }) if payload.trim().is_empty() => {
                issues.push("the step produced no output".to_string())
            }
            _ => {}
        }
        let advice = if snapshot.result_requirement.trim().is_empty() {
            BASE_ADVICE.to_string()
        } else {
            format!("{BASE_ADVICE} Required result: {}", snapshot.result_requirement.trim())
        };
        Some(Critique {
            confidence,
            issues,
            advice,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> PerceptionSnapshot {
        PerceptionSnapshot {
            entities: vec![],
            facts: vec!["France is in Europe".into()],
            result_requirement: "name of the capital".into(),
            confidence: 0.1,
            local_goal_achieved: false,
            original_goal_achieved: false,
            reasoning: String::new(),
            solution_summary: String::new(),
            memory_excerpt: String::new(),
        }
    }

    #[test]
    fn test_no_critique_above_threshold() {
        assert!(Critic::default().critique(0.3, &snapshot(), None).is_none());
    }

    #[test]
    fn test_critique_lists_issues() {
        let result = ExecutionResult::Success {
            payload: "partial".into(),
            partial_failures: vec!["search: 503".into()],
        };
        let critique = Critic::default()
            .critique(0.1, &snapshot(), Some(&result))
            .unwrap();
        assert_eq!(critique.confidence, 0.1);
        assert!(critique.issues.iter().any(|i| i.contains("entities")));
        assert!(critique.issues.iter().any(|i| i.contains("search: 503")));
        assert!(critique.advice.contains("name of the capital"));
    }
}
