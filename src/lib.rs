//! Hive - Rust 自主任务智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话数据模型、状态机、会话上下文、取消监管、运行时装配
//! - **react**: 感知、决策、步骤评估、Critic、主循环（AgentLoop）、dry-run 回放
//! - **tools**: 工具注册表（计数 + 禁用）、单次调用执行器、代码单元沙箱
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 长期记忆、失败记忆、分词、轨迹、工具性能日志、会话记录持久化
//! - **analysis**: 已持久化会话的离线分析
//! - **simulation**: 按查询列表批量运行会话

pub mod analysis;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod simulation;
pub mod tools;

pub use crate::core::{AgentError, AgentRuntime};
pub use crate::react::{AgentLoop, LoopOutcome, LoopPolicy, RunReport};
