//! 主循环：Perceive -> Decide -> Execute -> Evaluate
//!
//! 每一步开始前检查取消与步数预算；评估结果决定下一步：
//! - conclude：写终态记录并结束；
//! - continue：计划还有子目标时不重新感知，直接为下一个子目标决策，否则回到感知；
//! - replan / fail：消耗一次重试（超出预算即失败），记录失败记忆后回到感知；
//! - escalate：写挂起检查点并返回升级请求，会话可凭 resume token 恢复。
//!
//! 每次转换先写 TraceEvent 再执行；所有终态都以 RunReport 返回，不向调用方抛错。

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::{
    AgentError, Budget, CollaboratorError, EscalationRequest, Exchange, FailureReason, LoopState, Plan, PlanKind,
    RecoveryAction, RecoveryEngine, Resolution, SessionContext, SessionRecord, SessionStatus, Step,
};
use crate::memory::{
    Blackboard, InMemorySessionStore, InMemoryToolPerfLog, MemoryStore, NoopMemory, SessionStore,
    ToolPerfSink, ToolPerformanceSummary, TraceSink,
};
use crate::react::{
    ContextManager, Critic, Decider, DecisionInput, ParseOutcome, PerceptionInput, PerceptionSnapshot,
    Perceiver, SnapshotKind, Stage, StepEvaluator, StepOutcome, TermMatcher, TraceEvent,
};
use crate::tools::{ExecutionResult, Sandbox, SandboxLimits};

/// 可配置的循环策略（随会话记录保存，回放时沿用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopPolicy {
    pub max_steps: usize,
    pub max_retries: usize,
    pub low_confidence_threshold: f64,
    pub ban_threshold: u32,
    /// 单个代码单元最多调用工具次数
    pub call_budget: usize,
    pub time_budget_ms: u64,
    pub failure_memory: usize,
    pub strategy: String,
    /// 工具性能汇总取最近多少条
    pub summary_window: usize,
    #[serde(default)]
    pub matcher: TermMatcher,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            max_steps: 3,
            max_retries: 3,
            low_confidence_threshold: 0.3,
            ban_threshold: 3,
            call_budget: 5,
            time_budget_ms: 30_000,
            failure_memory: 3,
            strategy: "exploratory".to_string(),
            summary_window: 50,
            matcher: TermMatcher::default(),
        }
    }
}

/// 会话本次运行的结局
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Concluded { answer: String },
    /// 已挂起，等待人工输入
    Escalated(EscalationRequest),
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: LoopOutcome,
    /// 终态记录，或挂起检查点
    pub record: SessionRecord,
}

impl RunReport {
    pub fn status(&self) -> SessionStatus {
        self.record.final_status
    }
}

/// 协作方调用没有得到可用结果
enum Setback {
    /// 按 fail 结果处理：消耗一次重试
    Retry(String),
    /// 不可恢复，直接失败
    Abort(String),
}

/// sink 失败只记 warn，不影响循环
fn publish(trace: &dyn TraceSink, event: &TraceEvent) {
    tracing::debug!(session = %event.session_id, stage = %event.stage, "trace");
    if let Err(e) = trace.append(event) {
        tracing::warn!(session = %event.session_id, stage = %event.stage, error = %e, "Failed to append trace event");
    }
}

/// 下一步从哪里开始
enum Next {
    Perceive { kind: SnapshotKind, plan: PlanKind },
    /// 计划还有子目标：沿用快照直接决策
    Continue { snapshot: Arc<PerceptionSnapshot> },
}

pub struct AgentLoop {
    perceiver: Arc<dyn Perceiver>,
    decider: Arc<dyn Decider>,
    sandbox: Arc<dyn Sandbox>,
    evaluator: StepEvaluator,
    critic: Critic,
    recovery: RecoveryEngine,
    context: ContextManager,
    trace: Arc<dyn TraceSink>,
    sessions: Arc<dyn SessionStore>,
    perf_log: Arc<dyn ToolPerfSink>,
    policy: LoopPolicy,
}

impl AgentLoop {
    /// 默认使用内存中的轨迹、会话存储与性能日志
    pub fn new(
        perceiver: Arc<dyn Perceiver>,
        decider: Arc<dyn Decider>,
        sandbox: Arc<dyn Sandbox>,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            perceiver,
            decider,
            sandbox,
            evaluator: StepEvaluator::new(policy.low_confidence_threshold, policy.matcher.clone()),
            critic: Critic::new(policy.low_confidence_threshold),
            recovery: RecoveryEngine::new(),
            context: ContextManager::new(Arc::new(NoopMemory)),
            trace: Arc::new(Blackboard::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            perf_log: Arc::new(InMemoryToolPerfLog::new()),
            policy,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.context = ContextManager::new(memory);
        self
    }

    pub fn with_perf_log(mut self, perf_log: Arc<dyn ToolPerfSink>) -> Self {
        self.perf_log = perf_log;
        self
    }

    pub fn policy(&self) -> &LoopPolicy {
        &self.policy
    }

    /// 新会话
    pub async fn start(&self, ctx: &mut SessionContext) -> RunReport {
        tracing::info!(session = %ctx.session_id, query = %ctx.query, "Session started");
        self.emit(
            ctx,
            Stage::Start,
            json!({ "query": ctx.query, "max_steps": self.policy.max_steps, "max_retries": self.policy.max_retries }),
        );
        self.drive(
            ctx,
            Next::Perceive {
                kind: SnapshotKind::UserQuery,
                plan: PlanKind::Initial,
            },
        )
        .await
    }

    /// 带人工输入恢复一个已升级的会话；计数与工具统计沿用挂起前的值
    pub async fn resume(&self, ctx: &mut SessionContext, human_input: &str) -> RunReport {
        tracing::info!(session = %ctx.session_id, "Session resumed with human input");
        self.emit(
            ctx,
            Stage::Resume,
            json!({ "human_input": human_input, "step_count": ctx.step_count, "retry_count": ctx.retry_count }),
        );
        ctx.human_inputs.push(human_input.to_string());
        self.drive(
            ctx,
            Next::Perceive {
                kind: SnapshotKind::HumanInput,
                plan: PlanKind::Initial,
            },
        )
        .await
    }

    async fn drive(&self, ctx: &mut SessionContext, mut next: Next) -> RunReport {
        loop {
            if ctx.is_cancelled() {
                return self.fail(ctx, FailureReason::Cancelled);
            }
            if ctx.step_count >= self.policy.max_steps {
                return self.fail(
                    ctx,
                    FailureReason::BudgetExhausted {
                        budget: Budget::Steps,
                        limit: self.policy.max_steps,
                    },
                );
            }
            let started_at = Utc::now();

            let (snapshot, plan_kind) = match next {
                Next::Perceive { kind, plan } => match self.perceive(ctx, kind).await {
                    Ok(snapshot) => (snapshot, plan),
                    Err(setback) => match self.handle_setback(ctx, setback, "perception") {
                        Ok(retry) => {
                            next = retry;
                            continue;
                        }
                        Err(report) => return report,
                    },
                },
                Next::Continue { snapshot } => (snapshot, PlanKind::Continuation),
            };

            let plan = match self.decide(ctx, &snapshot, plan_kind).await {
                Ok(plan) => plan,
                Err(setback) => match self.handle_setback(ctx, setback, "decision") {
                    Ok(retry) => {
                        next = retry;
                        continue;
                    }
                    Err(report) => return report,
                },
            };

            ctx.step_count += 1;
            let index = ctx.step_count;
            let (execution, calls) = self.execute(ctx, &plan, index).await;

            ctx.enter(LoopState::Evaluating);
            let evaluation = self
                .evaluator
                .evaluate(&ctx.query, &snapshot, &execution, plan.remaining_sub_goals());
            if evaluation.clamped {
                self.emit(
                    ctx,
                    Stage::DataQuality,
                    json!({ "step": index, "raw_confidence": snapshot.confidence, "clamped_to": evaluation.confidence }),
                );
            }
            let confidence_delta = ctx.last_confidence.map(|prev| evaluation.confidence - prev);
            if let Some(delta) = confidence_delta.filter(|d| *d < 0.0) {
                self.emit(
                    ctx,
                    Stage::ConfidenceDecline,
                    json!({ "step": index, "delta": delta }),
                );
            }
            self.emit(
                ctx,
                Stage::Evaluate,
                json!({
                    "step": index,
                    "outcome": evaluation.outcome,
                    "confidence": evaluation.confidence,
                    "remaining_sub_goals": plan.remaining_sub_goals(),
                }),
            );
            let critique = self.critic.critique(evaluation.confidence, &snapshot, Some(&execution));
            if let Some(c) = &critique {
                self.emit(ctx, Stage::Critique, serde_json::to_value(c).unwrap_or(Value::Null));
            }

            let observation = execution.observation();
            ctx.steps.push(Step {
                index,
                plan: plan.clone(),
                snapshot: snapshot.clone(),
                execution: execution.clone(),
                calls,
                outcome: evaluation.outcome,
                confidence: evaluation.confidence,
                confidence_delta,
                started_at,
                finished_at: Utc::now(),
            });
            ctx.last_output = Some(observation.clone());
            ctx.last_confidence = Some(evaluation.confidence);
            tracing::info!(session = %ctx.session_id, step = index, outcome = %evaluation.outcome, "Step evaluated");

            match evaluation.outcome {
                StepOutcome::Conclude => {
                    self.emit(ctx, Stage::Conclude, json!({ "step": index }));
                    let answer = execution.payload().unwrap_or_default().to_string();
                    return self.conclude(ctx, answer);
                }
                StepOutcome::ContinuePlan => {
                    let remaining = plan.remaining_sub_goals();
                    self.emit(ctx, Stage::Continue, json!({ "step": index, "remaining_sub_goals": remaining }));
                    next = if remaining > 0 {
                        Next::Continue { snapshot }
                    } else {
                        Next::Perceive {
                            kind: SnapshotKind::StepResult,
                            plan: PlanKind::Initial,
                        }
                    };
                }
                StepOutcome::Replan | StepOutcome::Fail => {
                    ctx.failures.record(
                        format!("step {index} {}", evaluation.outcome),
                        snapshot.result_requirement.clone(),
                        &observation,
                    );
                    match self.consume_retry(ctx, evaluation.outcome.as_str()) {
                        Ok(retry) => next = retry,
                        Err(report) => return report,
                    }
                }
                StepOutcome::EscalateToHuman => {
                    return self.escalate(ctx, evaluation.confidence, &snapshot, critique);
                }
            }
        }
    }

    fn emit(&self, ctx: &mut SessionContext, stage: Stage, payload: Value) {
        ctx.stages.push(stage);
        publish(self.trace.as_ref(), &TraceEvent::new(ctx.session_id.clone(), stage, payload));
    }

    /// 存储失败：记 warn 并写 Error 事件，循环继续
    fn storage_error(&self, ctx: &mut SessionContext, storage: &str, err: &AgentError) {
        tracing::warn!(session = %ctx.session_id, storage, error = %err, "Storage operation failed");
        self.emit(ctx, Stage::Error, json!({ "storage": storage, "error": err.to_string() }));
    }

    fn tool_summary(&self, ctx: &mut SessionContext) -> ToolPerformanceSummary {
        match self.perf_log.summary(self.policy.summary_window) {
            Ok(summary) => summary,
            Err(e) => {
                self.storage_error(ctx, "tool_performance", &e);
                ToolPerformanceSummary::default()
            }
        }
    }

    fn collaborator_error(&self, err: &AgentError) -> CollaboratorError {
        CollaboratorError {
            message: err.to_string(),
            recoverable: matches!(self.recovery.handle(err), RecoveryAction::ConsumeRetry),
        }
    }

    async fn perceive(&self, ctx: &mut SessionContext, kind: SnapshotKind) -> Result<Arc<PerceptionSnapshot>, Setback> {
        let tool_summary = self.tool_summary(ctx);
        let input = PerceptionInput {
            session_id: ctx.session_id.clone(),
            query: ctx.query.clone(),
            kind,
            last_output: ctx.last_output.clone(),
            memory_excerpt: self.context.excerpt(&ctx.query, &ctx.failures, &ctx.human_inputs),
            tool_summary,
            banned_tools: ctx.registry.banned(),
            current_plan: (!ctx.plans.is_empty()).then(|| ctx.plans.render()),
            human_input: match kind {
                SnapshotKind::HumanInput => ctx.human_inputs.last().cloned(),
                _ => None,
            },
            previous_confidence: ctx.last_confidence,
        };
        ctx.enter(LoopState::Perceiving);
        self.emit(
            ctx,
            Stage::Perceive,
            json!({ "kind": kind, "memory_excerpt_chars": input.memory_excerpt.chars().count() }),
        );

        let mut correction: Option<String> = None;
        for attempt in 0..2 {
            let response = self
                .perceiver
                .perceive(&input, correction.as_deref())
                .await
                .map_err(|e| self.collaborator_error(&e));
            ctx.transcript.push(Exchange::Perception {
                response: response.clone(),
            });
            match response {
                Ok(ParseOutcome::Parsed(snapshot)) => return Ok(Arc::new(snapshot)),
                Ok(ParseOutcome::Malformed { diagnostic, .. }) => {
                    self.emit(
                        ctx,
                        Stage::Error,
                        json!({ "collaborator": "perception", "attempt": attempt + 1, "diagnostic": diagnostic }),
                    );
                    match self.recovery.handle(&AgentError::Perception(diagnostic.clone())) {
                        RecoveryAction::RetryWithPrompt(prompt) if attempt == 0 => {
                            tracing::warn!(session = %ctx.session_id, %diagnostic, "Malformed perception output, retrying");
                            correction = Some(prompt);
                        }
                        _ => return Err(Setback::Retry(format!("perception output malformed: {diagnostic}"))),
                    }
                }
                Err(err) => {
                    self.emit(
                        ctx,
                        Stage::Error,
                        json!({ "collaborator": "perception", "error": err.message, "recoverable": err.recoverable }),
                    );
                    return Err(if err.recoverable {
                        Setback::Retry(err.message)
                    } else {
                        Setback::Abort(err.message)
                    });
                }
            }
        }
        Err(Setback::Retry("perception output malformed".to_string()))
    }

    async fn decide(
        &self,
        ctx: &mut SessionContext,
        snapshot: &Arc<PerceptionSnapshot>,
        kind: PlanKind,
    ) -> Result<Arc<Plan>, Setback> {
        let previous = ctx.plans.latest().cloned();
        let (current_plan, next_sub_goal) = match (kind, &previous) {
            (PlanKind::Continuation, Some(prev)) => (
                prev.sub_goals.clone(),
                prev.sub_goals.get(prev.cursor + 1).cloned(),
            ),
            _ => (Vec::new(), None),
        };
        let catalogue = ctx.registry.catalogue();
        let tool_summary = self.tool_summary(ctx);
        let input = DecisionInput {
            query: ctx.query.clone(),
            kind,
            strategy: self.policy.strategy.clone(),
            snapshot: snapshot.as_ref().clone(),
            catalogue,
            last_output: ctx.last_output.clone(),
            tool_summary,
            current_plan,
            next_sub_goal,
        };
        ctx.enter(LoopState::Deciding);
        self.emit(
            ctx,
            Stage::Decide,
            json!({
                "kind": kind,
                "catalogue": input.catalogue.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            }),
        );

        let mut correction: Option<String> = None;
        for attempt in 0..2 {
            let response = self
                .decider
                .decide(&input, correction.as_deref())
                .await
                .map_err(|e| self.collaborator_error(&e));
            ctx.transcript.push(Exchange::Decision {
                response: response.clone(),
            });
            match response {
                Ok(ParseOutcome::Parsed(draft)) => {
                    let (sub_goals, cursor, parent) = match (kind, &previous) {
                        (PlanKind::Continuation, Some(prev)) => (prev.sub_goals.clone(), prev.cursor + 1, Some(prev.version)),
                        (PlanKind::Replan, Some(prev)) => (draft.sub_goals, 0, Some(prev.version)),
                        _ => (draft.sub_goals, 0, None),
                    };
                    let sub_goals = if sub_goals.is_empty() {
                        vec![ctx.query.clone()]
                    } else {
                        sub_goals
                    };
                    let plan = ctx.plans.push(Plan {
                        version: ctx.plans.next_version(),
                        kind,
                        sub_goals,
                        cursor,
                        code: draft.code,
                        parent,
                        created_at: Utc::now(),
                    });
                    tracing::debug!(session = %ctx.session_id, "\n{}", ctx.plans.render());
                    return Ok(plan);
                }
                Ok(ParseOutcome::Malformed { diagnostic, .. }) => {
                    self.emit(
                        ctx,
                        Stage::Error,
                        json!({ "collaborator": "decision", "attempt": attempt + 1, "diagnostic": diagnostic }),
                    );
                    match self.recovery.handle(&AgentError::Decision(diagnostic.clone())) {
                        RecoveryAction::RetryWithPrompt(prompt) if attempt == 0 => {
                            tracing::warn!(session = %ctx.session_id, %diagnostic, "Malformed decision output, retrying");
                            correction = Some(prompt);
                        }
                        _ => return Err(Setback::Retry(format!("decision output malformed: {diagnostic}"))),
                    }
                }
                Err(err) => {
                    self.emit(
                        ctx,
                        Stage::Error,
                        json!({ "collaborator": "decision", "error": err.message, "recoverable": err.recoverable }),
                    );
                    return Err(if err.recoverable {
                        Setback::Retry(err.message)
                    } else {
                        Setback::Abort(err.message)
                    });
                }
            }
        }
        Err(Setback::Retry("decision output malformed".to_string()))
    }

    async fn execute(
        &self,
        ctx: &mut SessionContext,
        plan: &Arc<Plan>,
        index: usize,
    ) -> (ExecutionResult, Vec<crate::tools::CallRecord>) {
        // 决策时的目录快照：执行期间新禁用的工具不抢占当前代码单元
        let allowed_tools: BTreeSet<String> = ctx.registry.catalogue().into_iter().map(|t| t.name).collect();
        let limits = SandboxLimits {
            call_budget: self.policy.call_budget,
            time_budget: Duration::from_millis(self.policy.time_budget_ms),
            allowed_tools,
        };
        ctx.enter(LoopState::Executing);
        self.emit(
            ctx,
            Stage::Execute,
            json!({
                "step": index,
                "plan_version": plan.version,
                "sub_goal": plan.current_sub_goal(),
                "tools": plan.code.tools_referenced(),
            }),
        );

        // 禁用在 record_outcome 内生效，Ban 事件在那一刻先写出
        let bans = Arc::new(AtomicUsize::new(0));
        let observer = {
            let trace = self.trace.clone();
            let session_id = ctx.session_id.clone();
            let bans = bans.clone();
            move |tool: &str, failures: u32| {
                let event = TraceEvent::new(session_id.clone(), Stage::Ban, json!({ "tool": tool, "failures": failures }));
                publish(trace.as_ref(), &event);
                bans.fetch_add(1, Ordering::SeqCst);
            }
        };
        ctx.registry.set_ban_observer(Some(Arc::new(observer)));
        let run = self.sandbox.run(&plan.code, &limits, &mut ctx.registry).await;
        ctx.registry.set_ban_observer(None);
        ctx.stages
            .extend(std::iter::repeat(Stage::Ban).take(bans.load(Ordering::SeqCst)));
        ctx.transcript.push(Exchange::Sandbox { run: run.clone() });

        if let ExecutionResult::Error { error } = &run.result {
            tracing::warn!(session = %ctx.session_id, step = index, %error, "Sandbox execution failed");
            self.emit(
                ctx,
                Stage::Error,
                json!({ "collaborator": "sandbox", "step": index, "error": error }),
            );
        }
        (run.result, run.calls)
    }

    fn handle_setback(&self, ctx: &mut SessionContext, setback: Setback, collaborator: &str) -> Result<Next, RunReport> {
        match setback {
            Setback::Retry(cause) => {
                ctx.failures.record(format!("{collaborator} failed"), "", &cause);
                self.consume_retry(ctx, &cause)
            }
            Setback::Abort(message) => Err(self.fail(ctx, FailureReason::Unrecoverable { message })),
        }
    }

    /// replan / fail：重试计数不会超过上限，超出时直接失败
    fn consume_retry(&self, ctx: &mut SessionContext, cause: &str) -> Result<Next, RunReport> {
        if ctx.retry_count + 1 > self.policy.max_retries {
            return Err(self.fail(
                ctx,
                FailureReason::BudgetExhausted {
                    budget: Budget::Retries,
                    limit: self.policy.max_retries,
                },
            ));
        }
        ctx.enter(LoopState::Replanning);
        self.emit(
            ctx,
            Stage::Replan,
            json!({ "cause": cause, "retry_count": ctx.retry_count + 1 }),
        );
        ctx.retry_count += 1;
        let kind = if ctx.last_output.is_some() {
            SnapshotKind::StepResult
        } else {
            SnapshotKind::UserQuery
        };
        Ok(Next::Perceive {
            kind,
            plan: PlanKind::Replan,
        })
    }

    fn conclude(&self, ctx: &mut SessionContext, answer: String) -> RunReport {
        tracing::info!(session = %ctx.session_id, steps = ctx.step_count, "Session concluded");
        let resolution = Resolution::Answer { text: answer.clone() };
        self.close(ctx, SessionStatus::Concluded, resolution, LoopOutcome::Concluded { answer })
    }

    fn fail(&self, ctx: &mut SessionContext, reason: FailureReason) -> RunReport {
        self.emit(
            ctx,
            Stage::Fail,
            json!({ "reason": reason.to_string(), "detail": reason, "step_count": ctx.step_count, "retry_count": ctx.retry_count }),
        );
        tracing::warn!(session = %ctx.session_id, %reason, "Session failed");
        let resolution = Resolution::Failure { reason: reason.clone() };
        self.close(ctx, SessionStatus::Failed, resolution, LoopOutcome::Failed { reason })
    }

    /// 终态：写一次会话记录，清除挂起检查点，写入长期记忆
    fn close(
        &self,
        ctx: &mut SessionContext,
        status: SessionStatus,
        resolution: Resolution,
        outcome: LoopOutcome,
    ) -> RunReport {
        ctx.enter(match status {
            SessionStatus::Concluded => LoopState::Concluded,
            _ => LoopState::Failed,
        });
        if let Err(e) = ctx.status.advance(status) {
            tracing::warn!(session = %ctx.session_id, error = %e, "Unexpected status transition");
        }
        let was_suspended = ctx.resume_token.take().is_some();
        let record = ctx.to_record(&self.policy, Some(resolution));
        if let Err(e) = self.sessions.write_final(&record) {
            self.storage_error(ctx, "session_record", &e);
        }
        if was_suspended {
            if let Err(e) = self.sessions.clear_suspended(&ctx.session_id) {
                self.storage_error(ctx, "suspended_checkpoint", &e);
            }
        }
        if let Err(e) = self.context.store().append(&record) {
            self.storage_error(ctx, "long_term_memory", &e);
        }
        RunReport { outcome, record }
    }

    fn escalate(
        &self,
        ctx: &mut SessionContext,
        confidence: f64,
        snapshot: &PerceptionSnapshot,
        critique: Option<crate::core::Critique>,
    ) -> RunReport {
        self.emit(
            ctx,
            Stage::Escalate,
            json!({ "confidence": confidence, "step_count": ctx.step_count }),
        );
        ctx.enter(LoopState::Escalated);
        if let Err(e) = ctx.status.advance(SessionStatus::Escalated) {
            tracing::warn!(session = %ctx.session_id, error = %e, "Unexpected status transition");
        }
        let token = Uuid::new_v4().to_string();
        ctx.resume_token = Some(token.clone());
        let question = if snapshot.result_requirement.trim().is_empty() {
            format!("Please help answer: {}", ctx.query)
        } else {
            format!(
                "Confidence is too low to continue. Please provide input for: {} (required: {})",
                ctx.query,
                snapshot.result_requirement.trim()
            )
        };
        let request = EscalationRequest {
            session_id: ctx.session_id.clone(),
            resume_token: token,
            question,
            confidence,
            critique,
            last_output: ctx.last_output.clone(),
            requested_at: Utc::now(),
        };
        let record = ctx.to_record(
            &self.policy,
            Some(Resolution::Escalation {
                request: request.clone(),
            }),
        );
        if let Err(e) = self.sessions.suspend(&record) {
            tracing::warn!(session = %ctx.session_id, error = %e, "Failed to checkpoint escalated session");
            self.emit(ctx, Stage::Error, json!({ "storage": "suspended_checkpoint", "error": e.to_string() }));
            return self.fail(
                ctx,
                FailureReason::Unrecoverable {
                    message: format!("could not persist escalation: {e}"),
                },
            );
        }
        tracing::info!(session = %ctx.session_id, "Session escalated to human");
        RunReport {
            outcome: LoopOutcome::Escalated(request),
            record,
        }
    }
}
