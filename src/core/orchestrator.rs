//! Agent 运行时：按配置装配主循环
//!
//! 负责：加载配置后创建 LLM、感知/决策协作方、沙箱、工具提供方与各类存储（会话记录、轨迹、工具性能日志、长期记忆），
//! 对外提供 start / resume / replay / cancel。

use std::sync::Arc;

use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::{AgentError, SessionContext, SessionSupervisor};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, DEEPSEEK_BASE_URL};
use crate::memory::{
    Blackboard, FanoutTraceSink, FileSessionStore, JsonlMemoryStore, JsonlToolPerfLog, JsonlTraceSink, SessionStore,
    ToolPerfSink, TraceSink,
};
use crate::react::{replay, AgentLoop, LlmDecision, LlmPerception, ReplayReport, RunReport};
use crate::tools::{script_sandbox, EchoTool, LocalTools, ToolProvider};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / DeepSeek / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = cfg.llm.timeouts.request;
    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            return Arc::new(MockLlmClient);
        }
        "deepseek" => {
            if let Ok(key) = std::env::var("DEEPSEEK_API_KEY") {
                let base = cfg.llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
                tracing::info!(model = %cfg.llm.model, "Using DeepSeek LLM");
                return Arc::new(
                    OpenAiClient::new(Some(base), &cfg.llm.model, &key, timeout)
                        .with_generation(cfg.llm.generation.clone()),
                );
            }
        }
        "openai" => {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                tracing::info!(model = %cfg.llm.model, "Using OpenAI LLM");
                return Arc::new(
                    OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, &key, timeout)
                        .with_generation(cfg.llm.generation.clone()),
                );
            }
        }
        other => tracing::warn!(provider = other, "Unknown LLM provider"),
    }
    tracing::warn!("No API key set or provider unknown, using Mock LLM");
    Arc::new(MockLlmClient)
}

/// 内置工具
pub fn default_tools() -> LocalTools {
    LocalTools::new().with(EchoTool)
}

pub struct AgentRuntime {
    config: AppConfig,
    agent: AgentLoop,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolProvider>,
    sessions: Arc<dyn SessionStore>,
    perf_log: Arc<dyn ToolPerfSink>,
    blackboard: Blackboard,
    supervisor: SessionSupervisor,
}

impl AgentRuntime {
    pub fn from_config(config: AppConfig) -> Self {
        let llm = create_llm_from_config(&config);
        Self::with_llm(config, llm)
    }

    /// 指定 LLM（测试中使用脚本客户端）
    pub fn with_llm(config: AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self::build(config, llm, Arc::new(default_tools()))
    }

    /// 替换工具提供方（之后创建的会话生效）
    pub fn with_tools(self, tools: Arc<dyn ToolProvider>) -> Self {
        Self { tools, ..self }
    }

    fn build(config: AppConfig, llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolProvider>) -> Self {
        let policy = config.to_policy();
        let sessions: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(config.sessions_dir()));
        let perf_log: Arc<dyn ToolPerfSink> = Arc::new(JsonlToolPerfLog::new(config.tool_performance_file()));
        let blackboard = Blackboard::new();
        let sinks: Vec<Arc<dyn TraceSink>> = vec![
            Arc::new(JsonlTraceSink::new(config.trace_file())),
            Arc::new(blackboard.clone()),
        ];
        let trace: Arc<dyn TraceSink> = Arc::new(FanoutTraceSink::new(sinks));
        let memory = Arc::new(JsonlMemoryStore::new(config.memory_file(), config.agent.memory_results));

        let agent = AgentLoop::new(
            Arc::new(LlmPerception::new(llm.clone())),
            Arc::new(LlmDecision::new(llm.clone())),
            Arc::new(script_sandbox(perf_log.clone())),
            policy,
        )
        .with_trace(trace)
        .with_sessions(sessions.clone())
        .with_memory(memory)
        .with_perf_log(perf_log.clone());

        tracing::info!(data_dir = %config.app.data_dir.display(), "Agent runtime ready");
        Self {
            config,
            agent,
            llm,
            tools,
            sessions,
            perf_log,
            blackboard,
            supervisor: SessionSupervisor::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn perf_log(&self) -> &Arc<dyn ToolPerfSink> {
        &self.perf_log
    }

    /// 本进程内所有会话的轨迹事件
    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 本进程累计的 (prompt, completion, total) token
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 新建会话并运行到终态或升级
    pub async fn start(&self, query: &str) -> RunReport {
        self.start_session(&Uuid::new_v4().to_string(), query).await
    }

    /// 指定会话 id（便于调用方提前登记取消）
    pub async fn start_session(&self, session_id: &str, query: &str) -> RunReport {
        let cancel = self.supervisor.register(session_id);
        let mut ctx = SessionContext::new(session_id, query, self.tools.clone(), self.agent.policy(), cancel);
        let report = self.agent.start(&mut ctx).await;
        self.supervisor.remove(session_id);
        report
    }

    /// 凭 resume token 恢复已升级的会话
    pub async fn resume(&self, session_id: &str, resume_token: &str, human_input: &str) -> Result<RunReport, AgentError> {
        let record = self.sessions.load_suspended(session_id)?;
        if record.resume_token.as_deref() != Some(resume_token) {
            return Err(AgentError::InvalidResumeToken(session_id.to_string()));
        }
        let cancel = self.supervisor.register(session_id);
        let mut ctx = SessionContext::from_record(record, self.tools.clone(), cancel);
        let report = self.agent.resume(&mut ctx, human_input).await;
        self.supervisor.remove(session_id);
        Ok(report)
    }

    /// 用记录中的协作方响应回放会话（终态记录优先，其次挂起检查点）
    pub async fn replay(&self, session_id: &str) -> Result<ReplayReport, AgentError> {
        let record = match self.sessions.load_final(session_id) {
            Ok(record) => record,
            Err(AgentError::SessionNotFound(_)) => self.sessions.load_suspended(session_id)?,
            Err(e) => return Err(e),
        };
        Ok(replay(&record).await)
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        self.supervisor.cancel(session_id)
    }

    pub fn cancel_all(&self) {
        self.supervisor.cancel_all();
    }
}
