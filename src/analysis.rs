//! 会话日志分析
//!
//! 扫描已持久化的会话记录，按结局分类（concluded → success，escalated → partial，failed → failed），
//! 汇总各工具的成功/失败次数，并附上工具性能日志的汇总。

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::core::{AgentError, SessionRecord, SessionStatus};
use crate::memory::{SessionStore, ToolPerfSink, ToolPerformanceSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    Partial,
    Failed,
    /// 尚未结束（正常不会出现在持久化记录中）
    Unknown,
}

pub fn classify(status: SessionStatus) -> OutcomeClass {
    match status {
        SessionStatus::Concluded => OutcomeClass::Success,
        SessionStatus::Escalated => OutcomeClass::Partial,
        SessionStatus::Failed => OutcomeClass::Failed,
        SessionStatus::Running => OutcomeClass::Unknown,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolOutcomeCounts {
    pub successes: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionAnalysis {
    pub total_sessions: usize,
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    pub unknown: usize,
    pub total_steps: usize,
    pub tools: BTreeMap<String, ToolOutcomeCounts>,
    pub tool_performance: ToolPerformanceSummary,
}

impl SessionAnalysis {
    pub fn success_rate(&self) -> f64 {
        if self.total_sessions == 0 {
            0.0
        } else {
            self.success as f64 / self.total_sessions as f64
        }
    }

    /// 终端输出用的文本报告
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Sessions: {}", self.total_sessions);
        let _ = writeln!(
            out,
            "  success: {}  partial: {}  failed: {}  (success rate {:.1}%)",
            self.success,
            self.partial,
            self.failed,
            self.success_rate() * 100.0
        );
        let _ = writeln!(out, "  steps: {}", self.total_steps);
        if !self.tools.is_empty() {
            let _ = writeln!(out, "Tools:");
            for (name, counts) in &self.tools {
                let _ = writeln!(out, "  {name}: {} ok / {} failed", counts.successes, counts.failures);
            }
        }
        let perf = &self.tool_performance;
        let _ = writeln!(
            out,
            "Tool log: {} calls, error rate {:.3}, avg latency {:.1} ms",
            perf.total_calls, perf.error_rate, perf.avg_latency_ms
        );
        for err in &perf.recent_errors {
            let _ = writeln!(out, "  ! {}: {}", err.tool_name, err.error);
        }
        out
    }
}

pub fn analyze(records: &[SessionRecord], tool_performance: ToolPerformanceSummary) -> SessionAnalysis {
    let mut analysis = SessionAnalysis {
        total_sessions: records.len(),
        tool_performance,
        ..SessionAnalysis::default()
    };
    for record in records {
        match classify(record.final_status) {
            OutcomeClass::Success => analysis.success += 1,
            OutcomeClass::Partial => analysis.partial += 1,
            OutcomeClass::Failed => analysis.failed += 1,
            OutcomeClass::Unknown => analysis.unknown += 1,
        }
        analysis.total_steps += record.steps.len();
        for call in record.calls() {
            let counts = analysis.tools.entry(call.tool.clone()).or_default();
            if call.succeeded {
                counts.successes += 1;
            } else {
                counts.failures += 1;
            }
        }
    }
    analysis
}

/// 终态记录 + 挂起检查点 + 工具性能日志
pub fn analyze_store(
    sessions: &dyn SessionStore,
    perf_log: &dyn ToolPerfSink,
    summary_window: usize,
) -> Result<SessionAnalysis, AgentError> {
    let mut records = sessions.list_final()?;
    records.extend(sessions.list_suspended()?);
    let summary = perf_log.summary(summary_window)?;
    tracing::info!(sessions = records.len(), "Analyzing session records");
    Ok(analyze(&records, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Plan, PlanKind, Step};
    use crate::memory::{InMemorySessionStore, InMemoryToolPerfLog};
    use crate::react::{PerceptionSnapshot, StepOutcome};
    use crate::tools::{CallRecord, CodeUnit, ExecutionResult, Op};
    use chrono::Utc;
    use std::sync::Arc;

    fn step(calls: Vec<CallRecord>) -> Step {
        Step {
            index: 1,
            plan: Arc::new(Plan {
                version: 1,
                kind: PlanKind::Initial,
                sub_goals: vec!["look up".into()],
                cursor: 0,
                code: CodeUnit {
                    ops: vec![Op::Return { value: "x".into() }],
                },
                parent: None,
                created_at: Utc::now(),
            }),
            snapshot: Arc::new(PerceptionSnapshot {
                entities: vec![],
                facts: vec![],
                result_requirement: String::new(),
                confidence: 0.9,
                local_goal_achieved: true,
                original_goal_achieved: true,
                reasoning: String::new(),
                solution_summary: String::new(),
                memory_excerpt: String::new(),
            }),
            execution: ExecutionResult::Success {
                payload: "x".into(),
                partial_failures: vec![],
            },
            calls,
            outcome: StepOutcome::Conclude,
            confidence: 0.9,
            confidence_delta: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn call(tool: &str, succeeded: bool) -> CallRecord {
        CallRecord {
            tool: tool.into(),
            succeeded,
            latency_ms: 5,
            detail: String::new(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(SessionStatus::Concluded), OutcomeClass::Success);
        assert_eq!(classify(SessionStatus::Escalated), OutcomeClass::Partial);
        assert_eq!(classify(SessionStatus::Failed), OutcomeClass::Failed);
    }

    #[test]
    fn test_analyze_store_counts_outcomes_and_tools() {
        let store = InMemorySessionStore::new();
        let mut done = SessionRecord::empty("a", "q");
        done.final_status = SessionStatus::Concluded;
        done.steps.push(step(vec![call("search", true), call("fetch", false)]));
        store.write_final(&done).unwrap();
        let mut failed = SessionRecord::empty("b", "q");
        failed.final_status = SessionStatus::Failed;
        failed.steps.push(step(vec![call("fetch", false)]));
        store.write_final(&failed).unwrap();
        let mut waiting = SessionRecord::empty("c", "q");
        waiting.final_status = SessionStatus::Escalated;
        store.suspend(&waiting).unwrap();

        let analysis = analyze_store(&store, &InMemoryToolPerfLog::new(), 50).unwrap();
        assert_eq!(analysis.total_sessions, 3);
        assert_eq!((analysis.success, analysis.partial, analysis.failed), (1, 1, 1));
        assert_eq!(analysis.tools["fetch"].failures, 2);
        assert_eq!(analysis.tools["search"].successes, 1);
        assert_eq!(analysis.total_steps, 2);
        let text = analysis.render();
        assert!(text.contains("Sessions: 3"));
        assert!(text.contains("fetch: 0 ok / 2 failed"));
    }
}
