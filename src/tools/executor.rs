//! 工具执行器
//!
//! 单次工具调用的统一入口：经 ToolRegistry 调用 provider，计时，
//! 无论成败都调用 record_outcome 并追加工具性能日志；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::{ToolPerfRecord, ToolPerfSink};
use crate::tools::ToolRegistry;

/// 调用结果预览最大字符数
const DETAIL_PREVIEW_CHARS: usize = 300;

/// 被时间预算中止的调用记录的错误文本
pub const TIMEOUT_ERROR: &str = "timeout";

/// 一次工具调用的记录（写入 Step，供回放与离线分析）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub tool: String,
    pub succeeded: bool,
    pub latency_ms: u64,
    /// 输出或错误的预览
    pub detail: String,
}

/// 一次调用的完整结果
#[derive(Debug)]
pub struct Invocation {
    pub record: CallRecord,
    pub output: Result<String, String>,
}

/// 工具执行器：调用、计数、记录
pub struct ToolExecutor {
    perf_log: Arc<dyn ToolPerfSink>,
}

impl ToolExecutor {
    pub fn new(perf_log: Arc<dyn ToolPerfSink>) -> Self {
        Self { perf_log }
    }

    pub async fn invoke(&self, registry: &mut ToolRegistry, tool_name: &str, args: Value) -> Invocation {
        let start = Instant::now();
        let args_preview = preview(&args.to_string(), 200);
        let output = registry.invoke(tool_name, args).await;
        let record = self.settle(registry, tool_name, start, &output, &args_preview);
        Invocation { record, output }
    }

    /// 调用被沙箱时间预算中止：按失败记账（计数、性能日志、调用记录）
    pub fn abandon(&self, registry: &mut ToolRegistry, tool_name: &str, started: Instant) -> CallRecord {
        let output = Err(TIMEOUT_ERROR.to_string());
        self.settle(registry, tool_name, started, &output, "")
    }

    fn settle(
        &self,
        registry: &mut ToolRegistry,
        tool_name: &str,
        started: Instant,
        output: &Result<String, String>,
        args_preview: &str,
    ) -> CallRecord {
        let latency_ms = started.elapsed().as_millis() as u64;
        let succeeded = output.is_ok();
        let outcome = match output {
            Ok(_) => "ok",
            Err(e) if e == TIMEOUT_ERROR => "timeout",
            Err(_) => "error",
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "session": registry.session_id(),
            "tool": tool_name,
            "ok": succeeded,
            "outcome": outcome,
            "duration_ms": latency_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        registry.record_outcome(tool_name, succeeded);

        let perf = ToolPerfRecord {
            timestamp: Utc::now(),
            session_id: registry.session_id().to_string(),
            tool_name: tool_name.to_string(),
            succeeded,
            latency_ms,
            error: output.as_ref().err().cloned(),
        };
        if let Err(e) = self.perf_log.append(&perf) {
            tracing::warn!(error = %e, tool = tool_name, "Failed to append tool performance record");
        }

        let detail = match output {
            Ok(text) => preview(text, DETAIL_PREVIEW_CHARS),
            Err(err) => preview(err, DETAIL_PREVIEW_CHARS),
        };
        CallRecord {
            tool: tool_name.to_string(),
            succeeded,
            latency_ms,
            detail,
        }
    }
}

/// 按字符截断并加省略号
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
