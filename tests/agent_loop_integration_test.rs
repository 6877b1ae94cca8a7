//! 主循环集成测试：配置装配的运行时、文件存储、升级恢复、回放、取消与工具禁用

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use hive::config::AppConfig;
    use hive::core::{AgentError, Budget, FailureReason, SessionContext, SessionStatus};
    use hive::llm::{LlmClient, ScriptedLlmClient};
    use hive::memory::{Blackboard, InMemorySessionStore, InMemoryToolPerfLog, SessionStore};
    use hive::react::{AgentLoop, LlmDecision, LlmPerception, LoopOutcome, LoopPolicy, Stage};
    use hive::tools::{script_sandbox, EchoTool, LocalTools, Tool, ToolProvider};
    use hive::AgentRuntime;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    fn config(data_dir: &Path) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = data_dir.to_path_buf();
        cfg.llm.provider = "mock".to_string();
        cfg
    }

    fn fenced(value: Value) -> Result<String, hive::llm::LlmError> {
        Ok(format!("```json\n{value}\n```"))
    }

    fn perception(confidence: f64, achieved: bool) -> Result<String, hive::llm::LlmError> {
        fenced(json!({
            "entities": ["France"],
            "facts": [],
            "result_requirement": "the capital city",
            "confidence": confidence,
            "local_goal_achieved": achieved,
            "original_goal_achieved": achieved,
            "reasoning": "",
            "solution_summary": "",
        }))
    }

    fn decision(ops: Value) -> Result<String, hive::llm::LlmError> {
        fenced(json!({ "plan": ["find the capital"], "code": { "ops": ops } }))
    }

    #[tokio::test]
    async fn test_mock_run_concludes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = AgentRuntime::from_config(config(dir.path()));

        let report = runtime.start("capital of France").await;
        assert_eq!(
            report.outcome,
            LoopOutcome::Concluded {
                answer: "capital of France".into()
            }
        );
        assert_eq!(report.record.step_count, 2);
        assert_eq!(
            runtime.blackboard().stages(),
            vec![
                Stage::Start,
                Stage::Perceive,
                Stage::Decide,
                Stage::Execute,
                Stage::Evaluate,
                Stage::Continue,
                Stage::Perceive,
                Stage::Decide,
                Stage::Execute,
                Stage::Evaluate,
                Stage::Conclude,
            ]
        );

        let id = &report.record.session_id;
        assert!(dir.path().join("sessions").join(format!("{id}.json")).exists());
        assert!(dir.path().join("trace.jsonl").exists());
        let perf = runtime.perf_log().recent(0).unwrap();
        assert_eq!(perf.len(), 1);
        assert_eq!(perf[0].tool_name, "echo");
        assert_eq!(perf[0].session_id, *id);
    }

    #[tokio::test]
    async fn test_replay_reproduces_stage_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = AgentRuntime::from_config(config(dir.path()));
        let report = runtime.start("capital of France").await;

        let replay = runtime.replay(&report.record.session_id).await.unwrap();
        assert!(replay.matches, "{:?} vs {:?}", replay.original, replay.replayed);
        assert_eq!(replay.unused_responses, 0);
        assert_eq!(replay.first_divergence(), None);
    }

    #[tokio::test]
    async fn test_step_budget_exhausted_is_structured_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.agent.max_steps = 1;
        let runtime = AgentRuntime::from_config(cfg);

        let report = runtime.start("capital of France").await;
        assert_eq!(
            report.outcome,
            LoopOutcome::Failed {
                reason: FailureReason::BudgetExhausted {
                    budget: Budget::Steps,
                    limit: 1
                }
            }
        );
        let stored = runtime.sessions().load_final(&report.record.session_id).unwrap();
        assert_eq!(stored.final_status, SessionStatus::Failed);
        assert_eq!(stored.step_count, 1);
    }

    #[tokio::test]
    async fn test_escalation_survives_restart_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            perception(0.2, false),
            decision(json!([{"op": "call", "tool": "echo", "args": {"text": "France"}}])),
            perception(0.9, true),
            decision(json!([{"op": "return", "value": "Paris is the capital of France"}])),
        ]));
        let runtime = AgentRuntime::with_llm(config(dir.path()), llm.clone());

        let report = runtime.start("capital of France").await;
        let request = match report.outcome {
            LoopOutcome::Escalated(request) => request,
            other => panic!("expected escalation, got {other:?}"),
        };
        let id = request.session_id.clone();
        assert!(dir.path().join("sessions/suspended").join(format!("{id}.json")).exists());
        assert!(request.critique.is_some());

        // 新进程：同一数据目录
        let restarted = AgentRuntime::with_llm(config(dir.path()), llm);
        let err = restarted.resume(&id, "wrong-token", "Paris").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidResumeToken(_)));

        let report = restarted
            .resume(&id, &request.resume_token, "It is Paris")
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            LoopOutcome::Concluded {
                answer: "Paris is the capital of France".into()
            }
        );
        assert_eq!(report.record.step_count, 2);
        assert_eq!(report.record.human_inputs, vec!["It is Paris".to_string()]);
        assert!(report.record.stages.contains(&Stage::Resume));
        assert!(!dir.path().join("sessions/suspended").join(format!("{id}.json")).exists());

        let replay = restarted.replay(&id).await.unwrap();
        assert!(replay.matches, "{:?} vs {:?}", replay.original, replay.replayed);
    }

    #[tokio::test]
    async fn test_malformed_decision_gets_corrective_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            perception(0.9, true),
            Ok("I would search the web".to_string()),
            decision(json!([{"op": "return", "value": "Paris is the capital of France"}])),
        ]));
        let runtime = AgentRuntime::with_llm(config(dir.path()), llm.clone());

        let report = runtime.start("capital of France").await;
        assert!(matches!(report.outcome, LoopOutcome::Concluded { .. }));
        assert_eq!(report.record.retry_count, 0);
        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 3);
        let retry_user = &prompts[2][1].content;
        assert!(retry_user.contains("could not be parsed"));
    }

    /// 执行时取消会话：模拟在第 1 步之后、第 2 步感知之前到达的取消请求
    struct CancelOnCall {
        token: CancellationToken,
    }

    #[async_trait]
    impl Tool for CancelOnCall {
        fn name(&self) -> &str {
            "lookup"
        }

        fn description(&self) -> &str {
            "looks things up"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            self.token.cancel();
            Ok("France has a capital".to_string())
        }
    }

    fn agent_loop(llm: Arc<dyn LlmClient>, board: &Blackboard) -> AgentLoop {
        let perf = Arc::new(InMemoryToolPerfLog::new());
        AgentLoop::new(
            Arc::new(LlmPerception::new(llm.clone())),
            Arc::new(LlmDecision::new(llm)),
            Arc::new(script_sandbox(perf.clone())),
            LoopPolicy::default(),
        )
        .with_trace(Arc::new(board.clone()))
        .with_sessions(Arc::new(InMemorySessionStore::new()))
        .with_perf_log(perf)
    }

    #[tokio::test]
    async fn test_cancel_after_first_step() {
        let token = CancellationToken::new();
        let tools: Arc<dyn ToolProvider> = Arc::new(LocalTools::new().with(CancelOnCall { token: token.clone() }));
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            perception(0.6, false),
            decision(json!([{"op": "call", "tool": "lookup", "args": {}}])),
        ]));
        let board = Blackboard::new();
        let agent = agent_loop(llm.clone(), &board);
        let mut ctx = SessionContext::new("s-cancel", "capital of France", tools, agent.policy(), token);

        let report = agent.start(&mut ctx).await;
        match &report.outcome {
            LoopOutcome::Failed { reason } => assert_eq!(reason.to_string(), "cancelled"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(report.record.steps.len(), 1);
        assert_eq!(report.record.final_status, SessionStatus::Failed);
        // 第 2 步的感知没有发生
        assert_eq!(llm.calls(), 2);
        assert_eq!(board.stages().last(), Some(&Stage::Fail));
    }

    struct Flaky;

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "fails every time"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("connection reset".to_string())
        }
    }

    #[tokio::test]
    async fn test_banned_tool_leaves_next_catalogue() {
        let tools: Arc<dyn ToolProvider> = Arc::new(LocalTools::new().with(EchoTool).with(Flaky));
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            perception(0.6, false),
            decision(json!([
                {"op": "call", "tool": "flaky"},
                {"op": "call", "tool": "flaky"},
                {"op": "call", "tool": "flaky"},
                {"op": "call", "tool": "echo", "args": {"text": "France capital research"}}
            ])),
            perception(0.9, true),
            decision(json!([{"op": "return", "value": "Paris is the capital of France"}])),
        ]));
        let board = Blackboard::new();
        let agent = agent_loop(llm, &board);
        let mut ctx = SessionContext::new("s-ban", "capital of France", tools, agent.policy(), CancellationToken::new());

        let report = agent.start(&mut ctx).await;
        assert!(matches!(report.outcome, LoopOutcome::Concluded { .. }));
        assert_eq!(report.record.tool_stats["flaky"].failures, 3);
        assert!(report.record.tool_stats["flaky"].banned);
        assert!(!ctx.registry.is_available("flaky"));

        let decides: Vec<Value> = board
            .events()
            .into_iter()
            .filter(|e| e.stage == Stage::Decide)
            .map(|e| e.payload)
            .collect();
        assert_eq!(decides.len(), 2);
        assert_eq!(decides[0]["catalogue"], json!(["echo", "flaky"]));
        assert_eq!(decides[1]["catalogue"], json!(["echo"]));
        assert_eq!(board.stages().iter().filter(|s| **s == Stage::Ban).count(), 1);
    }
}
