//! Dry-run 回放
//!
//! 用会话记录中按顺序保存的协作方响应（感知、决策、沙箱运行）替代真实的模型与工具，
//! 重新驱动主循环，比较回放得到的阶段序列与原记录是否一致。回放只使用内存中的轨迹与存储，不写任何文件。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, CollaboratorError, Exchange, SandboxError, SessionContext, SessionRecord};
use crate::llm::LlmError;
use crate::memory::{Blackboard, InMemorySessionStore, InMemoryToolPerfLog};
use crate::react::{
    AgentLoop, Decider, DecisionInput, LoopOutcome, ParseOutcome, PerceptionInput, PerceptionSnapshot, Perceiver,
    PlanDraft, Stage,
};
use crate::tools::{CodeUnit, ExecutionResult, LocalTools, Sandbox, SandboxLimits, SandboxRun, ToolRegistry};

/// 记录中的错误按原来的恢复动作还原
fn restore_error(err: CollaboratorError) -> AgentError {
    if err.recoverable {
        AgentError::Llm(LlmError::Api(err.message))
    } else {
        AgentError::Replay(err.message)
    }
}

fn exhausted(collaborator: &str) -> AgentError {
    AgentError::Replay(format!("no recorded {collaborator} response left"))
}

/// 按协作方分队列的录制响应
#[derive(Default)]
pub struct ReplayScript {
    perceptions: Mutex<VecDeque<Result<ParseOutcome<PerceptionSnapshot>, CollaboratorError>>>,
    decisions: Mutex<VecDeque<Result<ParseOutcome<PlanDraft>, CollaboratorError>>>,
    runs: Mutex<VecDeque<SandboxRun>>,
}

impl ReplayScript {
    pub fn from_transcript(transcript: &[Exchange]) -> Self {
        let script = Self::default();
        for exchange in transcript {
            match exchange.clone() {
                Exchange::Perception { response } => {
                    if let Ok(mut q) = script.perceptions.lock() {
                        q.push_back(response);
                    }
                }
                Exchange::Decision { response } => {
                    if let Ok(mut q) = script.decisions.lock() {
                        q.push_back(response);
                    }
                }
                Exchange::Sandbox { run } => {
                    if let Ok(mut q) = script.runs.lock() {
                        q.push_back(run);
                    }
                }
            }
        }
        script
    }

    /// 尚未消费的响应数
    pub fn remaining(&self) -> usize {
        let p = self.perceptions.lock().map(|q| q.len()).unwrap_or(0);
        let d = self.decisions.lock().map(|q| q.len()).unwrap_or(0);
        let r = self.runs.lock().map(|q| q.len()).unwrap_or(0);
        p + d + r
    }
}

#[async_trait]
impl Perceiver for ReplayScript {
    async fn perceive(
        &self,
        _input: &PerceptionInput,
        _correction: Option<&str>,
    ) -> Result<ParseOutcome<PerceptionSnapshot>, AgentError> {
        let next = self
            .perceptions
            .lock()
            .map_err(|e| AgentError::Replay(format!("replay lock poisoned: {e}")))?
            .pop_front();
        match next {
            Some(response) => response.map_err(restore_error),
            None => Err(exhausted("perception")),
        }
    }
}

#[async_trait]
impl Decider for ReplayScript {
    async fn decide(
        &self,
        _input: &DecisionInput,
        _correction: Option<&str>,
    ) -> Result<ParseOutcome<PlanDraft>, AgentError> {
        let next = self
            .decisions
            .lock()
            .map_err(|e| AgentError::Replay(format!("replay lock poisoned: {e}")))?
            .pop_front();
        match next {
            Some(response) => response.map_err(restore_error),
            None => Err(exhausted("decision")),
        }
    }
}

#[async_trait]
impl Sandbox for ReplayScript {
    /// 不执行代码：返回录制的运行结果，并按录制的调用重放工具计数（禁用判定随之一致）
    async fn run(&self, _code: &CodeUnit, _limits: &SandboxLimits, registry: &mut ToolRegistry) -> SandboxRun {
        let next = self.runs.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(run) => {
                for call in &run.calls {
                    registry.record_outcome(&call.tool, call.succeeded);
                }
                run
            }
            None => SandboxRun {
                result: ExecutionResult::Error {
                    error: SandboxError::ToolFailed {
                        tool: "replay".to_string(),
                        reason: exhausted("sandbox").to_string(),
                    },
                },
                calls: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub session_id: String,
    pub original: Vec<Stage>,
    pub replayed: Vec<Stage>,
    pub matches: bool,
    /// 回放结束后仍未消费的录制响应
    pub unused_responses: usize,
}

impl ReplayReport {
    /// 第一个不一致的位置
    pub fn first_divergence(&self) -> Option<usize> {
        if self.matches {
            return None;
        }
        let common = self.original.len().min(self.replayed.len());
        (0..common)
            .find(|&i| self.original[i] != self.replayed[i])
            .or(Some(common))
    }
}

/// 回放一条会话记录；记录中的人工输入按顺序用于恢复
pub async fn replay(record: &SessionRecord) -> ReplayReport {
    let script = Arc::new(ReplayScript::from_transcript(&record.transcript));
    let board = Blackboard::new();
    let agent = AgentLoop::new(script.clone(), script.clone(), script.clone(), record.policy.clone())
        .with_trace(Arc::new(board.clone()))
        .with_sessions(Arc::new(InMemorySessionStore::new()))
        .with_perf_log(Arc::new(InMemoryToolPerfLog::new()));

    let mut ctx = SessionContext::new(
        record.session_id.clone(),
        record.query.clone(),
        Arc::new(LocalTools::new()),
        &record.policy,
        CancellationToken::new(),
    );
    let mut report = agent.start(&mut ctx).await;
    let mut inputs = record.human_inputs.iter();
    while let LoopOutcome::Escalated(_) = report.outcome {
        match inputs.next() {
            Some(input) => report = agent.resume(&mut ctx, input).await,
            None => break,
        }
    }

    let replayed = board.stages();
    let matches = replayed == record.stages;
    if matches {
        tracing::info!(session = %record.session_id, stages = replayed.len(), "Replay matches recorded session");
    } else {
        tracing::warn!(session = %record.session_id, "Replay diverged from recorded session");
    }
    ReplayReport {
        session_id: record.session_id.clone(),
        original: record.stages.clone(),
        replayed,
        matches,
        unused_responses: script.remaining(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_transcript_diverges() {
        let mut record = SessionRecord::empty("s-empty", "capital of France");
        record.stages = vec![Stage::Start, Stage::Perceive, Stage::Decide];
        let report = replay(&record).await;
        assert!(!report.matches);
        assert_eq!(report.replayed.last(), Some(&Stage::Fail));
        assert_eq!(report.first_divergence(), Some(2));
    }

    #[test]
    fn test_recoverable_error_is_restored_as_retry() {
        let err = restore_error(CollaboratorError {
            message: "503".into(),
            recoverable: true,
        });
        assert!(matches!(err, AgentError::Llm(_)));
        let err = restore_error(CollaboratorError {
            message: "bad key".into(),
            recoverable: false,
        });
        assert!(matches!(err, AgentError::Replay(_)));
    }
}
