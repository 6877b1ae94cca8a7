//! 工具注册表
//!
//! - Tool / ToolProvider：工具发现层。所有工具实现 Tool trait（name / description / parameters_schema / execute），
//!   LocalTools 按名注册并对外提供 list_tools / invoke。
//! - ToolRegistry：单个会话的工具视图。持有 provider、本会话的成功/失败计数与禁用集合；
//!   失败次数达到阈值的工具在本会话内永久禁用，不再出现在 catalogue() 中。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（代码单元中 call 的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具目录条目：{name, input_schema, description}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub input_schema: Value,
    pub description: String,
}

/// 工具发现 / 调用层
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn list_tools(&self) -> Vec<ToolSpec>;

    async fn invoke(&self, name: &str, args: Value) -> Result<String, String>;
}

/// 进程内工具集合：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct LocalTools {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl LocalTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        tracing::debug!("Registered tool: {}", name);
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }
}

#[async_trait]
impl ToolProvider for LocalTools {
    fn list_tools(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                input_schema: tool.parameters_schema(),
                description: tool.description().to_string(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }
}

/// 单个工具在本会话内的计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStats {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub banned: bool,
}

/// 禁用回调：(工具名, 失败次数)，在禁用生效之前调用
pub type BanObserver = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// 会话级工具注册表：计数 + 禁用策略
pub struct ToolRegistry {
    provider: Arc<dyn ToolProvider>,
    session_id: String,
    ban_threshold: u32,
    stats: BTreeMap<String, ToolStats>,
    on_ban: Option<BanObserver>,
}

impl ToolRegistry {
    pub fn new(provider: Arc<dyn ToolProvider>, session_id: impl Into<String>, ban_threshold: u32) -> Self {
        Self {
            provider,
            session_id: session_id.into(),
            ban_threshold: ban_threshold.max(1),
            stats: BTreeMap::new(),
            on_ban: None,
        }
    }

    pub fn set_ban_observer(&mut self, observer: Option<BanObserver>) {
        self.on_ban = observer;
    }

    /// 恢复挂起会话时带回之前的计数
    pub fn with_stats(mut self, stats: BTreeMap<String, ToolStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ban_threshold(&self) -> u32 {
        self.ban_threshold
    }

    fn is_registered(&self, name: &str) -> bool {
        self.provider.list_tools().iter().any(|t| t.name == name)
    }

    /// 记录一次调用结果；返回 true 表示该工具因本次失败刚被禁用
    pub fn record_outcome(&mut self, tool_name: &str, succeeded: bool) -> bool {
        let threshold = self.ban_threshold;
        let stats = self.stats.entry(tool_name.to_string()).or_default();
        stats.attempts += 1;
        if succeeded {
            stats.successes += 1;
            return false;
        }
        stats.failures += 1;
        if stats.banned || stats.failures < threshold {
            return false;
        }
        if let Some(observer) = &self.on_ban {
            observer(tool_name, stats.failures);
        }
        stats.banned = true;
        tracing::warn!(
            tool = tool_name,
            failures = stats.failures,
            "Tool banned for the rest of the session"
        );
        true
    }

    /// 已注册且未被禁用
    pub fn is_available(&self, tool_name: &str) -> bool {
        let banned = self
            .stats
            .get(tool_name)
            .map(|s| s.failures >= self.ban_threshold)
            .unwrap_or(false);
        !banned && self.is_registered(tool_name)
    }

    /// 可用工具目录（排除已禁用工具），供决策阶段使用
    pub fn catalogue(&self) -> Vec<ToolSpec> {
        self.provider
            .list_tools()
            .into_iter()
            .filter(|spec| {
                self.stats
                    .get(&spec.name)
                    .map(|s| s.failures < self.ban_threshold)
                    .unwrap_or(true)
            })
            .collect()
    }

    pub fn banned(&self) -> Vec<String> {
        self.stats
            .iter()
            .filter(|(_, s)| s.banned)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn stats(&self) -> &BTreeMap<String, ToolStats> {
        &self.stats
    }

    pub async fn invoke(&self, tool_name: &str, args: Value) -> Result<String, String> {
        self.provider.invoke(tool_name, args).await
    }
}
