//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_STEPS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::GenerationSettings;
use crate::memory::Segmenter;
use crate::react::{LoopPolicy, MatchMode, TermMatcher};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub evaluator: EvaluatorSection,
    pub storage: StorageSection,
    pub simulation: SimulationSection,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 会话记录、轨迹、工具日志的根目录
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / deepseek / mock；没有对应 API Key 时退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
    /// [llm.generation]：temperature / top_p / seed / max_tokens / deterministic
    pub generation: GenerationSettings,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
            generation: GenerationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [agent] 段：循环预算与策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    pub max_retries: usize,
    pub low_confidence_threshold: f64,
    pub failure_memory: usize,
    pub strategy: String,
    /// 长期记忆每次检索返回的会话数
    pub memory_results: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 3,
            max_retries: 3,
            low_confidence_threshold: 0.3,
            failure_memory: 3,
            strategy: "exploratory".to_string(),
            memory_results: 3,
        }
    }
}

/// [tools] 段：禁用阈值与沙箱限额
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub ban_threshold: u32,
    pub call_budget: usize,
    pub time_budget_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            ban_threshold: 3,
            call_budget: 5,
            time_budget_secs: 30,
        }
    }
}

/// [evaluator] 段：离题检测的词项匹配
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluatorSection {
    pub min_term_len: usize,
    pub match_mode: MatchMode,
    pub segmenter: Segmenter,
    pub stop_words: Vec<String>,
}

impl Default for EvaluatorSection {
    fn default() -> Self {
        let matcher = TermMatcher::default();
        Self {
            min_term_len: matcher.min_term_len,
            match_mode: matcher.mode,
            segmenter: matcher.segmenter,
            stop_words: Vec::new(),
        }
    }
}

/// [storage] 段：路径相对 data_dir
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub sessions_dir: PathBuf,
    pub trace_file: PathBuf,
    pub tool_performance_file: PathBuf,
    pub memory_file: PathBuf,
    /// 工具性能汇总取最近多少条
    pub summary_window: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("sessions"),
            trace_file: PathBuf::from("trace.jsonl"),
            tool_performance_file: PathBuf::from("tool_performance.jsonl"),
            memory_file: PathBuf::from("memory.jsonl"),
            summary_window: 50,
        }
    }
}

/// [simulation] 段：批量模拟的轮数、间隔与查询列表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub runs: usize,
    /// 两次运行之间的间隔（秒），避免触发限流
    pub sleep_secs: f64,
    pub queries: Vec<String>,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            runs: 10,
            sleep_secs: 1.5,
            queries: vec!["What is the capital of France?".to_string()],
        }
    }
}

impl AppConfig {
    fn data_path(&self, relative: &PathBuf) -> PathBuf {
        self.app.data_dir.join(relative)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_path(&self.storage.sessions_dir)
    }

    pub fn trace_file(&self) -> PathBuf {
        self.data_path(&self.storage.trace_file)
    }

    pub fn tool_performance_file(&self) -> PathBuf {
        self.data_path(&self.storage.tool_performance_file)
    }

    pub fn memory_file(&self) -> PathBuf {
        self.data_path(&self.storage.memory_file)
    }

    pub fn matcher(&self) -> TermMatcher {
        TermMatcher {
            min_term_len: self.evaluator.min_term_len,
            mode: self.evaluator.match_mode,
            segmenter: self.evaluator.segmenter,
            ..TermMatcher::default()
        }
        .with_stop_words(self.evaluator.stop_words.iter().cloned())
    }

    /// 循环策略（写入每条会话记录）
    pub fn to_policy(&self) -> LoopPolicy {
        LoopPolicy {
            max_steps: self.agent.max_steps,
            max_retries: self.agent.max_retries,
            low_confidence_threshold: self.agent.low_confidence_threshold,
            ban_threshold: self.tools.ban_threshold,
            call_budget: self.tools.call_budget,
            time_budget_ms: self.tools.time_budget_secs.saturating_mul(1000),
            failure_memory: self.agent.failure_memory,
            strategy: self.agent.strategy.clone(),
            summary_window: self.storage.summary_window,
            matcher: self.matcher(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_loop_policy() {
        let policy = AppConfig::default().to_policy();
        let expected = LoopPolicy::default();
        assert_eq!(policy.max_steps, expected.max_steps);
        assert_eq!(policy.max_retries, expected.max_retries);
        assert_eq!(policy.ban_threshold, expected.ban_threshold);
        assert_eq!(policy.time_budget_ms, expected.time_budget_ms);
        assert_eq!(policy.summary_window, expected.summary_window);
        assert_eq!(policy.matcher, expected.matcher);
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_steps = 7\n\n[evaluator]\nmatch_mode = \"substring\"\nstop_words = [\"france\"]\n\n[app]\ndata_dir = \"/tmp/hive-data\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_steps, 7);
        assert_eq!(cfg.agent.max_retries, 3);
        assert_eq!(cfg.evaluator.match_mode, MatchMode::Substring);
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/tmp/hive-data/sessions"));
        let policy = cfg.to_policy();
        assert!(policy.matcher.stop_words.contains("france"));
        assert_eq!(policy.matcher.mode, MatchMode::Substring);
    }

    #[test]
    fn test_generation_section() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[llm.generation]\ntemperature = 0.3\nseed = 42\ndeterministic = true").unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.generation.seed, Some(42));
        assert!(cfg.llm.generation.deterministic);
        assert_eq!(cfg.llm.generation.effective().temperature, Some(0.0));
        assert_eq!(AppConfig::default().llm.generation, GenerationSettings::default());
    }
}
