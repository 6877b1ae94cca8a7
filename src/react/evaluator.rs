//! 步骤评估：把一次执行的结果归类为 continue / replan / conclude / escalate / fail
//!
//! 纯函数：相同的 (query, snapshot, result, 剩余子目标数) 总是得到相同结果。规则按顺序匹配：
//! 1. 执行出错 → Fail
//! 2. 置信度（截断到 [0,1] 后）低于阈值 → EscalateToHuman
//! 3. 输出与查询没有任何词项重叠 → Replan（空查询或空输出视为无重叠）
//! 4. 局部目标达成且没有剩余子目标 → Conclude
//! 5. 其他 → ContinuePlan

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::memory::tokenizer::{is_cjk_token, tokenize_with, Segmenter};
use crate::react::PerceptionSnapshot;
use crate::tools::ExecutionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    ContinuePlan,
    Replan,
    Conclude,
    EscalateToHuman,
    Fail,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::ContinuePlan => "continue_plan",
            StepOutcome::Replan => "replan",
            StepOutcome::Conclude => "conclude",
            StepOutcome::EscalateToHuman => "escalate_to_human",
            StepOutcome::Fail => "fail",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 词项匹配方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// 查询词与输出分词结果求交
    #[default]
    Token,
    /// 查询词作为子串出现在输出中即算命中
    Substring,
}

/// 离题检测用的词项匹配规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermMatcher {
    /// 查询词最小字符数（CJK 词不受限）
    pub min_term_len: usize,
    pub mode: MatchMode,
    pub segmenter: Segmenter,
    pub stop_words: HashSet<String>,
}

impl Default for TermMatcher {
    fn default() -> Self {
        Self {
            min_term_len: 4,
            mode: MatchMode::Token,
            segmenter: Segmenter::Auto,
            stop_words: HashSet::new(),
        }
    }
}

impl TermMatcher {
    pub fn with_stop_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.stop_words = words.into_iter().map(|w| w.as_ref().to_lowercase()).collect();
        self
    }

    /// 查询词：去停用词后按长度筛选；若没有词满足长度要求，退回全部非停用词
    pub fn query_terms(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let candidates: Vec<String> = tokenize_with(query, self.segmenter)
            .into_iter()
            .filter(|t| !self.stop_words.contains(t))
            .filter(|t| seen.insert(t.clone()))
            .collect();
        let qualifying: Vec<String> = candidates
            .iter()
            .filter(|t| is_cjk_token(t) || t.chars().count() >= self.min_term_len)
            .cloned()
            .collect();
        if qualifying.is_empty() {
            candidates
        } else {
            qualifying
        }
    }

    pub fn overlaps(&self, query: &str, output: &str) -> bool {
        if query.trim().is_empty() || output.trim().is_empty() {
            return false;
        }
        let terms = self.query_terms(query);
        if terms.is_empty() {
            return false;
        }
        match self.mode {
            MatchMode::Token => {
                let output_tokens: HashSet<String> = tokenize_with(output, self.segmenter).into_iter().collect();
                terms.iter().any(|t| output_tokens.contains(t))
            }
            MatchMode::Substring => {
                let lowered = output.to_lowercase();
                terms.iter().any(|t| lowered.contains(t.as_str()))
            }
        }
    }
}

/// 评估结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub outcome: StepOutcome,
    /// 截断后的置信度
    pub confidence: f64,
    /// 原始置信度是否越界（需要记录数据质量事件）
    pub clamped: bool,
}

/// 截断到 [0,1]；NaN 视为 0
pub fn clamp_confidence(raw: f64) -> (f64, bool) {
    if raw.is_nan() {
        return (0.0, true);
    }
    let clamped = raw.clamp(0.0, 1.0);
    (clamped, clamped != raw)
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepEvaluator {
    low_confidence_threshold: f64,
    matcher: TermMatcher,
}

impl Default for StepEvaluator {
    fn default() -> Self {
        Self::new(0.3, TermMatcher::default())
    }
}

impl StepEvaluator {
    pub fn new(low_confidence_threshold: f64, matcher: TermMatcher) -> Self {
        Self {
            low_confidence_threshold,
            matcher,
        }
    }

    pub fn low_confidence_threshold(&self) -> f64 {
        self.low_confidence_threshold
    }

    pub fn evaluate(
        &self,
        query: &str,
        snapshot: &PerceptionSnapshot,
        result: &ExecutionResult,
        remaining_sub_goals: usize,
    ) -> Evaluation {
        let (confidence, clamped) = clamp_confidence(snapshot.confidence);
        let outcome = match result {
            ExecutionResult::Error { .. } => StepOutcome::Fail,
            _ if confidence < self.low_confidence_threshold => StepOutcome::EscalateToHuman,
            ExecutionResult::Success { payload, .. } if !self.matcher.overlaps(query, payload) => {
                StepOutcome::Replan
            }
            _ if snapshot.local_goal_achieved && remaining_sub_goals == 0 => StepOutcome::Conclude,
            _ => StepOutcome::ContinuePlan,
        };
        Evaluation {
            outcome,
            confidence,
            clamped,
        }
    }
}
