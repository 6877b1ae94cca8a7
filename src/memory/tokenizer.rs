//! 分词模块
//!
//! 中英文混合分词，用于离题检测（词项重叠）与长期记忆检索。
//! 含 CJK 字符时使用 jieba-rs（搜索引擎模式），其余文本按非字母数字字符切分。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;
use serde::{Deserialize, Serialize};

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 分词策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segmenter {
    /// 含 CJK 时用 jieba，否则按非字母数字切分
    #[default]
    Auto,
    /// 只按空白切分，并去掉首尾标点
    Whitespace,
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // Extension A
        '\u{F900}'..='\u{FAFF}' |   // Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 词是否以 CJK 字符构成（CJK 词不受最小长度限制）
pub fn is_cjk_token(token: &str) -> bool {
    token.chars().next().map(is_cjk).unwrap_or(false)
}

fn split_alphanumeric(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
}

/// 按指定策略分词，结果全部小写、保持出现顺序（可能重复）
pub fn tokenize_with(text: &str, segmenter: Segmenter) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    match segmenter {
        Segmenter::Whitespace => text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
            .collect(),
        Segmenter::Auto if contains_cjk(text) => get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .flat_map(|piece| {
                if is_cjk_token(piece) {
                    vec![piece.to_string()]
                } else {
                    split_alphanumeric(piece).collect()
                }
            })
            .collect(),
        Segmenter::Auto => split_alphanumeric(text).collect(),
    }
}

/// 默认策略分词
pub fn tokenize(text: &str) -> Vec<String> {
    tokenize_with(text, Segmenter::Auto)
}

/// 分词并返回词集合
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 两个词集合的重叠分数（交集大小）
pub fn overlap_score(set1: &HashSet<String>, set2: &HashSet<String>) -> usize {
    set1.intersection(set2).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("Paris is the capital, of France!");
        assert_eq!(tokens, vec!["paris", "is", "the", "capital", "of", "france"]);
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("法国的首都是巴黎");
        assert!(tokens.iter().any(|t| t == "巴黎"));
        assert!(tokens.iter().all(|t| !t.trim().is_empty()));
    }

    #[test]
    fn test_tokenize_mixed() {
        let tokens = tokenize("我喜欢 Rust 编程语言");
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.iter().any(|t| t.contains("编程")));
    }

    #[test]
    fn test_whitespace_segmenter() {
        let tokens = tokenize_with("state-of-the-art (model)", Segmenter::Whitespace);
        assert_eq!(tokens, vec!["state-of-the-art", "model"]);
    }

    #[test]
    fn test_empty_text() {
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_overlap_score() {
        let a = tokenize_to_set("Rust programming");
        let b = tokenize_to_set("rust language");
        assert_eq!(overlap_score(&a, &b), 1);
    }
}
