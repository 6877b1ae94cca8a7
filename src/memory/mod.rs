//! 记忆层：失败记忆（会话内）、长期记忆（跨会话检索）、轨迹、工具性能日志、会话记录持久化

pub mod long_term;
pub mod persistence;
pub mod tokenizer;
pub mod tool_performance;
pub mod trace;
pub mod working;

pub use long_term::{InMemoryStore, JsonlMemoryStore, MemoryEntry, MemoryStore, NoopMemory};
pub use persistence::{FileSessionStore, InMemorySessionStore, SessionStore};
pub use tokenizer::{tokenize, tokenize_with, Segmenter};
pub use tool_performance::{
    summarize, InMemoryToolPerfLog, JsonlToolPerfLog, PerToolSummary, RecentError, ToolPerfRecord,
    ToolPerfSink, ToolPerformanceSummary,
};
pub use trace::{Blackboard, FanoutTraceSink, JsonlTraceSink, TraceSink};
pub use working::{FailureMemory, FailureNote};
