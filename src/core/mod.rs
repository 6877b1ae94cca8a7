//! 核心编排层：错误与恢复、会话数据模型、状态机、会话上下文、会话监管、运行时装配

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session;
pub mod session_supervisor;
pub mod state;

pub use context::SessionContext;
pub use error::{AgentError, Budget, RecoveryAction, SandboxError};
pub use orchestrator::{create_llm_from_config, default_tools, AgentRuntime};
pub use recovery::RecoveryEngine;
pub use session::{
    CollaboratorError, Critique, EscalationRequest, Exchange, FailureReason, Plan, PlanHistory, PlanKind, Resolution,
    SessionRecord, Step,
};
pub use session_supervisor::SessionSupervisor;
pub use state::{LoopState, SessionStatus};
