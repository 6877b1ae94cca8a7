//! 会话上下文
//!
//! 单个会话的全部可变状态（步数/重试计数、工具注册表、失败记忆、计划历史、轨迹阶段、协作方响应记录）
//! 显式放在这里，逐个传给各组件；不存在进程级全局计数，多个会话可以并发运行。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::core::{Exchange, LoopState, PlanHistory, Resolution, SessionRecord, SessionStatus, Step};
use crate::memory::FailureMemory;
use crate::react::{LoopPolicy, Stage};
use crate::tools::{ToolProvider, ToolRegistry};

pub struct SessionContext {
    pub session_id: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// 主循环当前阶段（不持久化）
    pub state: LoopState,
    pub step_count: usize,
    pub retry_count: usize,
    pub registry: ToolRegistry,
    pub failures: FailureMemory,
    pub plans: PlanHistory,
    pub steps: Vec<Step>,
    pub transcript: Vec<Exchange>,
    pub stages: Vec<Stage>,
    pub human_inputs: Vec<String>,
    pub last_output: Option<String>,
    pub last_confidence: Option<f64>,
    pub resume_token: Option<String>,
    cancel: CancellationToken,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        query: impl Into<String>,
        provider: Arc<dyn ToolProvider>,
        policy: &LoopPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            registry: ToolRegistry::new(provider, session_id.clone(), policy.ban_threshold),
            session_id,
            query: query.into(),
            created_at: Utc::now(),
            status: SessionStatus::Running,
            state: LoopState::Init,
            step_count: 0,
            retry_count: 0,
            failures: FailureMemory::new(policy.failure_memory),
            plans: PlanHistory::new(),
            steps: Vec::new(),
            transcript: Vec::new(),
            stages: Vec::new(),
            human_inputs: Vec::new(),
            last_output: None,
            last_confidence: None,
            resume_token: None,
            cancel,
        }
    }

    /// 从挂起检查点恢复：计数、工具统计、失败记忆全部沿用
    pub fn from_record(record: SessionRecord, provider: Arc<dyn ToolProvider>, cancel: CancellationToken) -> Self {
        let registry = ToolRegistry::new(provider, record.session_id.clone(), record.policy.ban_threshold)
            .with_stats(record.tool_stats);
        Self {
            session_id: record.session_id,
            query: record.query,
            created_at: record.created_at,
            status: record.final_status,
            state: match record.final_status {
                SessionStatus::Escalated => LoopState::Escalated,
                _ => LoopState::Init,
            },
            step_count: record.step_count,
            retry_count: record.retry_count,
            registry,
            failures: FailureMemory::restore(record.policy.failure_memory, record.failure_memory),
            plans: record.plans,
            steps: record.steps,
            transcript: record.transcript,
            stages: record.stages,
            human_inputs: record.human_inputs,
            last_output: record.last_output,
            last_confidence: record.last_confidence,
            resume_token: record.resume_token,
            cancel,
        }
    }

    pub fn enter(&mut self, state: LoopState) {
        tracing::debug!(session = %self.session_id, from = ?self.state, to = ?state, "Loop state");
        self.state = state;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn to_record(&self, policy: &LoopPolicy, resolution: Option<Resolution>) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            closed_at: self.status.is_final().then(Utc::now),
            query: self.query.clone(),
            steps: self.steps.clone(),
            plans: self.plans.clone(),
            final_status: self.status,
            final_answer_or_escalation: resolution,
            step_count: self.step_count,
            retry_count: self.retry_count,
            tool_stats: self.registry.stats().clone(),
            failure_memory: self.failures.notes(),
            human_inputs: self.human_inputs.clone(),
            resume_token: self.resume_token.clone(),
            last_output: self.last_output.clone(),
            last_confidence: self.last_confidence,
            policy: policy.clone(),
            transcript: self.transcript.clone(),
            stages: self.stages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, LocalTools};

    #[test]
    fn test_record_roundtrip_preserves_counters() {
        let provider: Arc<dyn ToolProvider> = Arc::new(LocalTools::new().with(EchoTool));
        let policy = LoopPolicy::default();
        let mut ctx = SessionContext::new("s-1", "q", provider.clone(), &policy, CancellationToken::new());
        ctx.step_count = 2;
        ctx.retry_count = 1;
        ctx.registry.record_outcome("echo", false);
        ctx.failures.record("step 1 replan", "x", "y");
        ctx.status = SessionStatus::Escalated;

        let record = ctx.to_record(&policy, None);
        assert!(record.closed_at.is_none());
        let restored = SessionContext::from_record(record, provider, CancellationToken::new());
        assert_eq!(restored.step_count, 2);
        assert_eq!(restored.retry_count, 1);
        assert_eq!(restored.registry.stats()["echo"].failures, 1);
        assert_eq!(restored.failures.len(), 1);
        assert_eq!(restored.status, SessionStatus::Escalated);
        assert_eq!(restored.state, LoopState::Escalated);
    }

    #[test]
    fn test_cancellation_is_observed() {
        let token = CancellationToken::new();
        let ctx = SessionContext::new(
            "s-2",
            "q",
            Arc::new(LocalTools::new()),
            &LoopPolicy::default(),
            token.clone(),
        );
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
