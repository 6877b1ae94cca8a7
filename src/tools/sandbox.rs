//! 沙箱：执行决策阶段生成的代码单元
//!
//! 代码单元是一个受限的 JSON 指令序列（call / return），沙箱只负责：
//! - 调用次数不超过 call_budget，超出即中止并报 CallBudgetExceeded；
//! - 整体执行超过 time_budget 报 Timeout；
//! - 中间步骤的工具失败记入 partial_failures，最后一个操作失败才作为错误返回；
//! - 每次工具调用都经 ToolExecutor（record_outcome + 性能日志），因超时被中止的调用按失败记账。
//!
//! 字符串参数与 return 值中的 `{{name}}` 会被替换为之前 save_as 保存的输出，`{{last}}` 为上一次调用输出。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::SandboxError;
use crate::tools::{CallRecord, ToolExecutor, ToolRegistry};

/// 代码单元：按顺序执行的操作列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CodeUnit {
    pub ops: Vec<Op>,
}

/// 单个操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// 调用目录中的工具
    Call {
        tool: String,
        #[serde(default)]
        args: Value,
        /// 保存输出，供后续 `{{name}}` 引用
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
    },
    /// 以文本作为本单元的结果
    Return { value: String },
}

impl CodeUnit {
    pub fn tools_referenced(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Call { tool, .. } => Some(tool.as_str()),
                Op::Return { .. } => None,
            })
            .collect()
    }
}

/// 本次执行的限额与可用工具快照（决策时的目录）
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub call_budget: usize,
    pub time_budget: Duration,
    pub allowed_tools: BTreeSet<String>,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        payload: String,
        /// 非最后操作的工具失败（部分成功）
        #[serde(default)]
        partial_failures: Vec<String>,
    },
    Error { error: SandboxError },
}

impl ExecutionResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionResult::Error { .. })
    }

    pub fn payload(&self) -> Option<&str> {
        match self {
            ExecutionResult::Success { payload, .. } => Some(payload),
            ExecutionResult::Error { .. } => None,
        }
    }

    /// 供下一轮感知阅读的文本
    pub fn observation(&self) -> String {
        match self {
            ExecutionResult::Success { payload, .. } => payload.clone(),
            ExecutionResult::Error { error } => format!("Error: {error}"),
        }
    }
}

/// 一次沙箱运行：结果 + 实际发生的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRun {
    pub result: ExecutionResult,
    pub calls: Vec<CallRecord>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, code: &CodeUnit, limits: &SandboxLimits, registry: &mut ToolRegistry) -> SandboxRun;
}

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").ok()).as_ref()
}

/// 单遍替换：替换进来的文本不再展开，未知名称原样保留
fn substitute(text: &str, vars: &HashMap<String, String>) -> String {
    let Some(re) = placeholder_re() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

fn substitute_value(value: &Value, vars: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// 解释执行 CodeUnit 的沙箱实现
pub struct ScriptSandbox {
    executor: ToolExecutor,
}

impl ScriptSandbox {
    pub fn new(executor: ToolExecutor) -> Self {
        Self { executor }
    }

    async fn interpret(
        &self,
        code: &CodeUnit,
        limits: &SandboxLimits,
        registry: &mut ToolRegistry,
        calls: &mut Vec<CallRecord>,
        pending: &mut Option<(String, Instant)>,
    ) -> Result<ExecutionResult, SandboxError> {
        let last = code.ops.len().checked_sub(1).ok_or(SandboxError::EmptyCode)?;
        let mut vars: HashMap<String, String> = HashMap::new();
        let mut payload = String::new();
        let mut partial_failures = Vec::new();
        let mut invocations = 0usize;

        for (i, op) in code.ops.iter().enumerate() {
            match op {
                Op::Return { value } => {
                    payload = substitute(value, &vars);
                }
                Op::Call { tool, args, save_as } => {
                    if invocations >= limits.call_budget {
                        return Err(SandboxError::CallBudgetExceeded {
                            budget: limits.call_budget,
                        });
                    }
                    if !limits.allowed_tools.contains(tool) {
                        if i == last {
                            return Err(SandboxError::ToolUnavailable { tool: tool.clone() });
                        }
                        partial_failures.push(format!("{tool}: not available"));
                        continue;
                    }
                    invocations += 1;
                    let args = substitute_value(args, &vars);
                    *pending = Some((tool.clone(), Instant::now()));
                    let invocation = self.executor.invoke(registry, tool, args).await;
                    *pending = None;
                    calls.push(invocation.record);
                    match invocation.output {
                        Ok(output) => {
                            if let Some(name) = save_as {
                                vars.insert(name.clone(), output.clone());
                            }
                            vars.insert("last".to_string(), output.clone());
                            payload = output;
                        }
                        Err(reason) => {
                            if i == last {
                                return Err(SandboxError::ToolFailed {
                                    tool: tool.clone(),
                                    reason,
                                });
                            }
                            partial_failures.push(format!("{tool}: {reason}"));
                        }
                    }
                }
            }
        }

        Ok(ExecutionResult::Success {
            payload,
            partial_failures,
        })
    }
}

#[async_trait]
impl Sandbox for ScriptSandbox {
    async fn run(&self, code: &CodeUnit, limits: &SandboxLimits, registry: &mut ToolRegistry) -> SandboxRun {
        let mut calls = Vec::new();
        // 超时时被中止的调用：future 被丢弃前来不及记账
        let mut pending = None;
        let outcome = tokio::time::timeout(
            limits.time_budget,
            self.interpret(code, limits, registry, &mut calls, &mut pending),
        )
        .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => ExecutionResult::Error { error },
            Err(_) => {
                if let Some((tool, started)) = pending.take() {
                    calls.push(self.executor.abandon(registry, &tool, started));
                }
                ExecutionResult::Error {
                    error: SandboxError::Timeout {
                        budget_ms: limits.time_budget.as_millis() as u64,
                    },
                }
            }
        };
        SandboxRun { result, calls }
    }
}

/// 便捷构造：共享同一个性能日志
pub fn script_sandbox(perf_log: Arc<dyn crate::memory::ToolPerfSink>) -> ScriptSandbox {
    ScriptSandbox::new(ToolExecutor::new(perf_log))
}
